//! Storage path templates.
//!
//! A template such as `:class/:attachment/:id/:style/:filename` is
//! interpolated per style. Every store of an attachment resolves paths
//! through the attachment, so a style lives at the same key everywhere.

use std::borrow::Cow;
use std::sync::Arc;

use vellum_shared::types::RecordId;

use crate::attachment::{AttachmentRecord, Style};

/// Tokens ordered longest first so that no token shadows a longer one.
const TOKENS: [&str; 7] = [
    "attachment",
    "extension",
    "basename",
    "filename",
    "class",
    "style",
    "id",
];

/// Values substituted into a template.
#[derive(Debug, Clone, Copy)]
pub struct PathValues<'a> {
    /// Record class.
    pub class: &'a str,
    /// Attachment name.
    pub attachment: &'a str,
    /// Record id; empty when unsaved.
    pub id: Option<RecordId>,
    /// Style being resolved.
    pub style: &'a Style,
    /// Stored file name.
    pub filename: &'a str,
}

impl PathValues<'_> {
    fn lookup(&self, token: &str) -> Cow<'_, str> {
        match token {
            "class" => Cow::Borrowed(self.class),
            "attachment" => Cow::Borrowed(self.attachment),
            "id" => self
                .id
                .map_or(Cow::Borrowed(""), |id| Cow::Owned(id.to_string())),
            "style" => Cow::Borrowed(self.style.as_str()),
            "filename" => Cow::Borrowed(self.filename),
            "basename" => Cow::Borrowed(split_extension(self.filename).0),
            "extension" => Cow::Borrowed(split_extension(self.filename).1),
            _ => Cow::Borrowed(""),
        }
    }
}

fn split_extension(filename: &str) -> (&str, &str) {
    match filename.rfind('.') {
        Some(0) | None => (filename, ""),
        Some(dot) => (&filename[..dot], &filename[dot + 1..]),
    }
}

/// A path template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathTemplate(String);

impl PathTemplate {
    /// Wrap a template string.
    #[must_use]
    pub fn new(template: &str) -> Self {
        Self(template.to_string())
    }

    /// The raw template.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Substitute every known token. Unknown `:words` are kept verbatim.
    #[must_use]
    pub fn interpolate(&self, values: &PathValues<'_>) -> String {
        let mut out = String::with_capacity(self.0.len() + 32);
        let mut rest = self.0.as_str();
        while let Some(pos) = rest.find(':') {
            out.push_str(&rest[..pos]);
            let after = &rest[pos + 1..];
            if let Some(token) = TOKENS.iter().find(|t| after.starts_with(**t)) {
                out.push_str(&values.lookup(token));
                rest = &after[token.len()..];
            } else {
                out.push(':');
                rest = after;
            }
        }
        out.push_str(rest);
        out
    }
}

/// Resolves the storage path of a style.
pub trait PathResolver: Send + Sync {
    /// Path of `style`, or `None` when no file is assigned.
    fn path(&self, style: &Style) -> Option<String>;
}

/// Path resolution for one attachment on one record.
pub struct AttachmentLocator {
    class: String,
    name: String,
    template: PathTemplate,
    record: Arc<dyn AttachmentRecord>,
}

impl AttachmentLocator {
    /// Create a locator.
    #[must_use]
    pub fn new(
        class: impl Into<String>,
        name: impl Into<String>,
        template: PathTemplate,
        record: Arc<dyn AttachmentRecord>,
    ) -> Self {
        Self {
            class: class.into(),
            name: name.into(),
            template,
            record,
        }
    }
}

impl PathResolver for AttachmentLocator {
    fn path(&self, style: &Style) -> Option<String> {
        let file = self.record.file()?;
        Some(self.template.interpolate(&PathValues {
            class: &self.class,
            attachment: &self.name,
            id: self.record.id(),
            style,
            filename: &file.file_name,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    fn record_id() -> RecordId {
        "550e8400-e29b-41d4-a716-446655440000"
            .parse()
            .expect("valid uuid")
    }

    fn values<'a>(style: &'a Style, filename: &'a str) -> PathValues<'a> {
        PathValues {
            class: "dummies",
            attachment: "avatar",
            id: Some(record_id()),
            style,
            filename,
        }
    }

    #[rstest]
    #[case(
        ":class/:attachment/:id/:style/:filename",
        "dummies/avatar/550e8400-e29b-41d4-a716-446655440000/thumb/photo.png"
    )]
    #[case(":id/:style/:basename.:extension", "550e8400-e29b-41d4-a716-446655440000/thumb/photo.png")]
    #[case(":attachment_:style", "avatar_thumb")]
    #[case("static/:unknown/:style", "static/:unknown/thumb")]
    #[case("no-tokens", "no-tokens")]
    fn test_interpolate(#[case] template: &str, #[case] expected: &str) {
        let style = Style::new("thumb");
        let path = PathTemplate::new(template).interpolate(&values(&style, "photo.png"));
        assert_eq!(path, expected);
    }

    #[rstest]
    #[case("archive.tar.gz", "archive.tar", "gz")]
    #[case("README", "README", "")]
    #[case(".env", ".env", "")]
    fn test_split_extension(#[case] name: &str, #[case] base: &str, #[case] ext: &str) {
        assert_eq!(split_extension(name), (base, ext));
    }

    #[test]
    fn test_missing_id_interpolates_empty() {
        let style = Style::original();
        let mut values = values(&style, "a.png");
        values.id = None;
        assert_eq!(PathTemplate::new(":id/:style").interpolate(&values), "/original");
    }

    proptest! {
        #[test]
        fn prop_templates_without_colons_are_unchanged(template in "[a-zA-Z0-9_./-]{0,40}") {
            let style = Style::new("thumb");
            let path = PathTemplate::new(&template).interpolate(&values(&style, "x.png"));
            prop_assert_eq!(path, template);
        }

        #[test]
        fn prop_style_token_always_resolves(style in "[a-z]{1,12}") {
            let style = Style::new(style);
            let path = PathTemplate::new("base/:style").interpolate(&values(&style, "x.png"));
            prop_assert_eq!(path, format!("base/{}", style.as_str()));
        }
    }
}
