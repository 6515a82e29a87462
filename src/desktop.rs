//! Desktop entry and run script generators

use crate::descriptor::ProjectDescriptor;

/// Command the desktop entry launches, installed in `/app/bin`.
pub const RUN_SCRIPT: &str = "game.sh";
/// Where the game payload lives inside the bundle.
pub const GAME_INSTALL_DIR: &str = "/app/lib/game";
const FALLBACK_CATEGORY: &str = "Game";

pub fn file_name(app_id: &str) -> String {
    format!("{}.desktop", app_id)
}

/// Escape a value per the desktop entry `string` type.
fn escape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out
}

/// `Categories=` value: the fallback plus the first game sub-category.
pub fn launch_categories(descriptor: &ProjectDescriptor) -> String {
    match descriptor.primary_game_category() {
        Some(category) => format!("{};{};", FALLBACK_CATEGORY, category),
        None => format!("{};", FALLBACK_CATEGORY),
    }
}

pub fn render(descriptor: &ProjectDescriptor) -> String {
    let mut lines = vec![
        "[Desktop Entry]".to_string(),
        "Type=Application".to_string(),
        format!("Name={}", escape_value(&descriptor.name)),
        format!("Comment={}", escape_value(&descriptor.summary)),
        format!("Exec={}", RUN_SCRIPT),
    ];
    if descriptor.install_icon {
        lines.push(format!("Icon={}", descriptor.app_id));
    }
    lines.push(format!("Categories={}", launch_categories(descriptor)));

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// Wrapper that starts the game from its install directory.
pub fn render_run_script(launcher_script: &str) -> String {
    format!(
        "#!/bin/sh\ncd {dir}/ || exit 1\nexport RENPY_PERFORMANCE_TEST=0\nexec sh \"./{launcher}\" \"$@\"\n",
        dir = GAME_INSTALL_DIR,
        launcher = launcher_script
    )
}
