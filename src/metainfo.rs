//! AppStream metainfo generator
//!
//! Output is a pure function of the descriptor: fixed element order,
//! sorted rating attributes, ascending releases, no timestamps.

use std::fmt::Write;

use crate::descriptor::ProjectDescriptor;

pub const METADATA_LICENSE: &str = "CC0-1.0";
pub const OARS_VERSION: &str = "oars-1.0";
const RECOMMENDED_CONTROLS: [&str; 4] = ["pointing", "keyboard", "touch", "gamepad"];
const MIN_DISPLAY_LENGTH: u32 = 360;

pub fn file_name(app_id: &str) -> String {
    format!("{}.metainfo.xml", app_id)
}

/// Escape text and attribute values.
pub fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

struct XmlWriter {
    out: String,
    depth: usize,
}

impl XmlWriter {
    fn new() -> Self {
        Self {
            out: String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n"),
            depth: 0,
        }
    }

    fn indent(&mut self) {
        for _ in 0..self.depth {
            self.out.push_str("  ");
        }
    }

    fn attrs(attrs: &[(&str, &str)]) -> String {
        attrs
            .iter()
            .map(|(k, v)| format!(" {}=\"{}\"", k, escape_xml(v)))
            .collect()
    }

    fn open(&mut self, tag: &str, attrs: &[(&str, &str)]) {
        self.indent();
        let _ = writeln!(self.out, "<{}{}>", tag, Self::attrs(attrs));
        self.depth += 1;
    }

    fn close(&mut self, tag: &str) {
        self.depth -= 1;
        self.indent();
        let _ = writeln!(self.out, "</{}>", tag);
    }

    fn text(&mut self, tag: &str, attrs: &[(&str, &str)], text: &str) {
        self.indent();
        let _ = writeln!(
            self.out,
            "<{tag}{}>{}</{tag}>",
            Self::attrs(attrs),
            escape_xml(text),
            tag = tag
        );
    }

    fn empty(&mut self, tag: &str, attrs: &[(&str, &str)]) {
        self.indent();
        let _ = writeln!(self.out, "<{}{}/>", tag, Self::attrs(attrs));
    }

    fn finish(self) -> String {
        self.out
    }
}

/// Render the metainfo document for `descriptor`.
pub fn render(descriptor: &ProjectDescriptor) -> String {
    let app_id = descriptor.app_id.as_str();
    let mut xml = XmlWriter::new();

    xml.open("component", &[("type", "desktop-application")]);
    xml.text("id", &[], app_id);
    xml.text("name", &[], &descriptor.name);
    xml.text("summary", &[], &descriptor.summary);
    xml.text("metadata_license", &[], METADATA_LICENSE);
    xml.text("project_license", &[], &descriptor.license.render());

    xml.open("recommends", &[]);
    for control in RECOMMENDED_CONTROLS {
        xml.text("control", &[], control);
    }
    xml.close("recommends");

    xml.open("requires", &[]);
    xml.text("display_length", &[("compare", "ge")], &MIN_DISPLAY_LENGTH.to_string());
    xml.text("internet", &[], "offline-only");
    xml.close("requires");

    if !descriptor.categories.is_empty() {
        xml.open("categories", &[]);
        for category in &descriptor.categories {
            xml.text("category", &[], category.as_str());
        }
        xml.close("categories");
    }

    xml.open("description", &[]);
    for paragraph in descriptor.description_paragraphs() {
        xml.text("p", &[], &paragraph);
    }
    xml.close("description");

    xml.text("launchable", &[("type", "desktop-id")], &crate::desktop::file_name(app_id));

    // An absent block means unrated; it is not the same as all-none.
    if let Some(ratings) = &descriptor.content_rating {
        if ratings.is_empty() {
            xml.empty("content_rating", &[("type", OARS_VERSION)]);
        } else {
            xml.open("content_rating", &[("type", OARS_VERSION)]);
            for (id, level) in ratings {
                xml.text("content_attribute", &[("id", id.as_str())], level.as_str());
            }
            xml.close("content_rating");
        }
    }

    if !descriptor.releases.is_empty() {
        xml.open("releases", &[]);
        for release in &descriptor.releases {
            let date = release.date.format("%Y-%m-%d").to_string();
            xml.empty(
                "release",
                &[("version", release.version.raw.as_str()), ("date", date.as_str())],
            );
        }
        xml.close("releases");
    }

    xml.close("component");
    xml.finish()
}
