//! Canonical layout for extracted forms.
//!
//! Sections and fields are recognised by their numbering (`2. Title`,
//! `2.1 Label`), so the same rewrite applies to model markdown and to a
//! local text layer:
//!
//! ```text
//! ## 2. Your details
//!
//! ### 2.1 Name
//! value: `Jan Jansen`
//!
//! ### 2.2 Marital status
//! (type: radio)
//! - (x) married
//! - ( ) single
//!
//! ### 2.3 Address
//! Street: `Dorpsstraat 1`
//! Postcode: `1234 AB`
//! ```
//!
//! Text before the first numbered heading, and text that fits no field, is
//! kept verbatim. Rewriting canonical output yields the same output.

use crate::pipeline::normalize::normalize_selection_markers;
use once_cell::sync::Lazy;
use regex::Regex;

/// Labels that make a `Label: value` line one part of a multi-line address.
const ADDRESS_WORDS: [&str; 12] = [
    "street", "straat", "house", "huisnummer", "postcode", "postal", "zip", "city", "plaats",
    "woonplaats", "country", "land",
];

static RE_LEAD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:#{1,6}[ \t]+)?(?:[-*+][ \t]+)?").unwrap());
static RE_FIELD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{1,3}(?:\.\d{1,3})+)\.?[ \t]+(\S.*)$").unwrap());
static RE_SECTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{1,3})\.[ \t]*([^\d\s].*)$").unwrap());
static RE_OPTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\((?:x| )\)|\[(?:x| )\])[ \t]*(.*)$").unwrap());
static RE_TYPE_HINT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\(type: (?:radio|checkbox)\)$").unwrap());
static RE_LABELLED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([^:`/]{1,60}?):[ \t]*(.*)$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Choice {
    Radio,
    Checkbox,
}

impl Choice {
    fn as_str(&self) -> &'static str {
        match self {
            Choice::Radio => "radio",
            Choice::Checkbox => "checkbox",
        }
    }

    fn marker(&self, selected: bool) -> &'static str {
        match (self, selected) {
            (Choice::Radio, true) => "(x)",
            (Choice::Radio, false) => "( )",
            (Choice::Checkbox, true) => "[x]",
            (Choice::Checkbox, false) => "[ ]",
        }
    }
}

#[derive(Debug, Default)]
struct Field {
    id: String,
    label: String,
    value: Option<String>,
    options: Vec<(Choice, bool, String)>,
    /// `Label: value` lines that do not stand for the field's own value.
    parts: Vec<(String, String)>,
    /// Anything else under the field, verbatim.
    notes: Vec<String>,
}

#[derive(Debug, Default)]
struct Section {
    heading: Option<(String, String)>,
    description: Vec<String>,
    fields: Vec<Field>,
}

/// Rewrite page content into the canonical layout.
///
/// Returns `None` when the content has no numbered section or field to
/// anchor the layout; callers keep the content as it is.
pub fn to_canonical(content: &str) -> Option<String> {
    let sections = parse(content);
    if !sections
        .iter()
        .any(|s| s.heading.is_some() || !s.fields.is_empty())
    {
        return None;
    }
    Some(render(&sections))
}

fn parse(content: &str) -> Vec<Section> {
    let content = normalize_selection_markers(content);
    let mut sections = vec![Section::default()];
    let mut field: Option<Field> = None;

    for raw in content.lines() {
        let line = raw.trim();
        if line.is_empty() || RE_TYPE_HINT.is_match(line) {
            continue;
        }
        let bare = RE_LEAD.replace(line, "");
        let bare = bare.trim();

        if let Some(caps) = RE_FIELD.captures(bare) {
            close_field(&mut sections, field.take());
            field = Some(Field {
                id: caps[1].to_string(),
                label: caps[2].trim().to_string(),
                ..Field::default()
            });
            continue;
        }
        if let Some(caps) = RE_SECTION.captures(bare) {
            close_field(&mut sections, field.take());
            sections.push(Section {
                heading: Some((caps[1].to_string(), caps[2].trim().to_string())),
                ..Section::default()
            });
            continue;
        }

        match field.as_mut() {
            Some(current) => absorb(current, line, bare),
            None => {
                if let Some(section) = sections.last_mut() {
                    section.description.push(line.to_string());
                }
            }
        }
    }
    close_field(&mut sections, field);
    sections
}

/// Attach one line of body text to the open field.
fn absorb(field: &mut Field, line: &str, bare: &str) {
    if let Some(caps) = RE_OPTION.captures(bare) {
        let choice = if caps[1].starts_with('(') {
            Choice::Radio
        } else {
            Choice::Checkbox
        };
        field
            .options
            .push((choice, caps[1].contains('x'), caps[2].trim().to_string()));
        return;
    }
    if let Some(caps) = RE_LABELLED.captures(bare) {
        let label = caps[1].trim();
        let value = strip_code(caps[2].trim());
        if label.eq_ignore_ascii_case("value") && field.value.is_none() {
            field.value = Some(value);
        } else if !is_address_part(label)
            && field.value.is_none()
            && field.options.is_empty()
            && field.parts.is_empty()
        {
            field.value = Some(value);
        } else {
            field.parts.push((label.to_string(), value));
        }
        return;
    }
    if field.value.is_none() && field.options.is_empty() && field.parts.is_empty() {
        field.value = Some(strip_code(bare));
    } else {
        field.notes.push(line.to_string());
    }
}

fn close_field(sections: &mut [Section], field: Option<Field>) {
    if let (Some(field), Some(section)) = (field, sections.last_mut()) {
        section.fields.push(field);
    }
}

fn is_address_part(label: &str) -> bool {
    label
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .any(|word| ADDRESS_WORDS.contains(&word))
}

fn strip_code(value: &str) -> String {
    value
        .strip_prefix('`')
        .and_then(|v| v.strip_suffix('`'))
        .unwrap_or(value)
        .to_string()
}

fn render(sections: &[Section]) -> String {
    let mut blocks = Vec::new();
    for section in sections {
        if let Some((id, title)) = &section.heading {
            blocks.push(format!("## {id}. {title}"));
        }
        if !section.description.is_empty() {
            blocks.push(section.description.join("\n"));
        }
        blocks.extend(section.fields.iter().map(render_field));
    }
    blocks.join("\n\n")
}

fn render_field(field: &Field) -> String {
    let mut lines = vec![format!("### {} {}", field.id, field.label)];
    if let Some(&(kind, _, _)) = field.options.first() {
        lines.push(format!("(type: {})", kind.as_str()));
        for (choice, selected, label) in &field.options {
            lines.push(format!("- {} {}", choice.marker(*selected), label).trim_end().to_string());
        }
        if let Some(value) = &field.value {
            lines.push(format!("value: `{value}`"));
        }
    } else if field.parts.is_empty() || field.value.is_some() {
        lines.push(format!("value: `{}`", field.value.as_deref().unwrap_or("")));
    }
    lines.extend(field.parts.iter().map(|(label, value)| format!("{label}: `{value}`")));
    lines.extend(field.notes.iter().cloned());
    lines.join("\n")
}
