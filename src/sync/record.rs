//! Per-record assembly of canonical output fields.
//!
//! A [`RecordBuilder`] collects direct field assignments, ordered description
//! fragments and keyword entries. [`RecordLayout`] is the declarative list of
//! rules that drives a builder from one source row.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

pub type SourceRow = BTreeMap<String, String>;
pub type CanonicalFields = BTreeMap<String, String>;

pub const DESCRIPTION_FIELD: &str = "Description";
pub const KEYWORDS_FIELD: &str = "Keywords";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("keyword vocabulary must be a lowercase identifier: {0:?}")]
    InvalidVocabulary(String),
    #[error("failed to parse date: {0:?}")]
    InvalidDate(String),
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Keyword {
    pub vocabulary: String,
    pub value: String,
}

#[derive(Debug, Clone)]
struct Fragment {
    order: i64,
    seq: usize,
    html: String,
}

#[derive(Debug, Clone, Default)]
pub struct RecordBuilder {
    fragments: Vec<Fragment>,
    keywords: Vec<Keyword>,
    output: CanonicalFields,
    consumed: BTreeSet<String>,
    ignore_values: Vec<String>,
    dirty: bool,
}

fn is_vocabulary(raw: &str) -> bool {
    let mut chars = raw.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
}

/// Parse `vocab:"value", vocab2:"value2"` lists. Entries with a blank side
/// are dropped.
pub fn parse_keyword_list(raw: &str) -> Vec<Keyword> {
    let mut out = Vec::new();
    let mut rest = raw;
    while let Some(open) = rest.find(":\"") {
        let head = &rest[..open];
        let vocabulary: String = head
            .chars()
            .rev()
            .take_while(|c| c.is_ascii_lowercase() || *c == '-' || *c == '_' || c.is_ascii_digit())
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        let after = &rest[open + 2..];
        let Some(close) = after.find('"') else {
            break;
        };
        let value = &after[..close];
        if !vocabulary.trim().is_empty() && !value.trim().is_empty() {
            out.push(Keyword {
                vocabulary,
                value: value.to_string(),
            });
        }
        rest = &after[close + 1..];
    }
    out
}

pub fn render_keywords(keywords: &[Keyword]) -> String {
    let mut sorted = keywords.to_vec();
    sorted.sort();
    sorted
        .iter()
        .map(|k| format!("{}:\"{}\"", k.vocabulary, k.value))
        .collect::<Vec<_>>()
        .join(", ")
}

fn parse_single_date(raw: &str) -> Result<String, RecordError> {
    let input = raw.trim();
    let all_digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    if input.len() == 4 && all_digits(input) {
        return Ok(input.to_string());
    }
    let iso = if input.len() >= 10
        && input.is_char_boundary(10)
        && input.as_bytes()[4] == b'-'
        && input.as_bytes()[7] == b'-'
        && all_digits(&input[..4])
    {
        input[..10].to_string()
    } else if input.len() == 8 && all_digits(input) {
        format!("{}-{}-{}", &input[..4], &input[4..6], &input[6..8])
    } else {
        // Spreadsheet exports sometimes carry YYYYMMDD as 1.8500101E7.
        let parsed = input
            .parse::<f64>()
            .map_err(|_| RecordError::InvalidDate(raw.to_string()))?;
        if !parsed.is_finite() || parsed < 0.0 {
            return Err(RecordError::InvalidDate(raw.to_string()));
        }
        let digits = format!("{}", parsed.trunc() as u64);
        if digits.len() != 8 {
            return Err(RecordError::InvalidDate(raw.to_string()));
        }
        format!("{}-{}-{}", &digits[..4], &digits[4..6], &digits[6..8])
    };
    let canonical = match iso.strip_suffix("00") {
        Some(prefix) => format!("{prefix}01"),
        None => iso,
    };
    NaiveDate::parse_from_str(&canonical, "%Y-%m-%d")
        .map_err(|_| RecordError::InvalidDate(raw.to_string()))?;
    Ok(canonical)
}

/// Normalize a date cell into `YYYY-MM-DD` (or a bare `YYYY`). A comma list
/// yields its earliest date.
pub fn parse_date(raw: &str) -> Result<String, RecordError> {
    if raw.contains(',') {
        let mut dates = raw
            .split(',')
            .map(parse_single_date)
            .collect::<Result<Vec<_>, _>>()?;
        dates.sort();
        return dates
            .into_iter()
            .next()
            .ok_or_else(|| RecordError::InvalidDate(raw.to_string()));
    }
    parse_single_date(raw)
}

impl RecordBuilder {
    pub fn new(ignore_values: &[String]) -> Self {
        Self {
            ignore_values: ignore_values
                .iter()
                .map(|v| v.trim().to_lowercase())
                .collect(),
            ..Self::default()
        }
    }

    /// True when `row[column]` is non-blank and not an ignored placeholder.
    pub fn has(&self, row: &SourceRow, column: &str) -> bool {
        let Some(raw) = row.get(column) else {
            return false;
        };
        let trimmed = raw.trim();
        !trimmed.is_empty() && !self.ignore_values.contains(&trimmed.to_lowercase())
    }

    fn take(&mut self, row: &SourceRow, column: &str) -> Option<String> {
        if !self.has(row, column) {
            return None;
        }
        self.consumed.insert(column.to_string());
        row.get(column).map(|v| v.trim().to_string())
    }

    pub fn set_field(&mut self, name: &str, value: impl Into<String>) {
        self.output.insert(name.to_string(), value.into());
    }

    pub fn single_assign(&mut self, row: &SourceRow, column: &str, field: &str) {
        if let Some(value) = self.take(row, column) {
            self.output.insert(field.to_string(), value);
        }
    }

    /// Assign a normalized date. An unparseable cell leaves the field unset
    /// and the column unconsumed.
    pub fn assign_date(&mut self, row: &SourceRow, column: &str, field: &str) -> bool {
        if !self.has(row, column) {
            return false;
        }
        let raw = row.get(column).map(String::as_str).unwrap_or_default();
        match parse_date(raw) {
            Ok(date) => {
                self.consumed.insert(column.to_string());
                self.output.insert(field.to_string(), date);
                true
            }
            Err(err) => {
                tracing::warn!(column, %err, "date left unset");
                false
            }
        }
    }

    pub fn add_description_html(&mut self, html: impl Into<String>, order: i64) {
        let seq = self.fragments.len();
        self.fragments.push(Fragment {
            order,
            seq,
            html: html.into(),
        });
        self.dirty = true;
    }

    pub fn add_description_entry(
        &mut self,
        row: &SourceRow,
        column: &str,
        label: &str,
        order: i64,
        value_for_blank: Option<&str>,
    ) {
        let html = match self.take(row, column) {
            Some(value) => format!("<p>{label}: {value} </p>"),
            None => match value_for_blank {
                Some(blank) => format!("<p>{label}: {blank} </p>"),
                None => return,
            },
        };
        self.add_description_html(html, order);
    }

    pub fn add_keyword(&mut self, vocabulary: &str, value: &str) -> Result<(), RecordError> {
        if !is_vocabulary(vocabulary) {
            return Err(RecordError::InvalidVocabulary(vocabulary.to_string()));
        }
        self.keywords.push(Keyword {
            vocabulary: vocabulary.to_string(),
            value: value.to_string(),
        });
        self.dirty = true;
        Ok(())
    }

    pub fn add_keyword_entry(
        &mut self,
        row: &SourceRow,
        column: &str,
        vocabulary: &str,
    ) -> Result<(), RecordError> {
        if !is_vocabulary(vocabulary) {
            return Err(RecordError::InvalidVocabulary(vocabulary.to_string()));
        }
        if let Some(value) = self.take(row, column) {
            self.add_keyword(vocabulary, &value)?;
        }
        Ok(())
    }

    /// One keyword per `delimiter`-separated item of `row[column]`. Items are
    /// trimmed; blank and repeated items are skipped.
    pub fn add_keywords_split(
        &mut self,
        row: &SourceRow,
        column: &str,
        vocabulary: &str,
        delimiter: &str,
        lowercase: bool,
    ) -> Result<(), RecordError> {
        if !is_vocabulary(vocabulary) {
            return Err(RecordError::InvalidVocabulary(vocabulary.to_string()));
        }
        let Some(raw) = self.take(row, column) else {
            return Ok(());
        };
        let mut seen = BTreeSet::new();
        for item in raw.split(delimiter).map(str::trim) {
            if item.is_empty() {
                continue;
            }
            let value = if lowercase {
                item.to_lowercase()
            } else {
                item.to_string()
            };
            if seen.insert(value.clone()) {
                self.add_keyword(vocabulary, &value)?;
            }
        }
        Ok(())
    }

    pub fn add_keywords_from(&mut self, row: &SourceRow, column: &str) {
        if let Some(raw) = self.take(row, column) {
            for keyword in parse_keyword_list(&raw) {
                self.keywords.push(keyword);
                self.dirty = true;
            }
        }
    }

    pub fn finalize(&mut self) {
        if !self.dirty {
            return;
        }
        if !self.fragments.is_empty() {
            let mut parts: Vec<&Fragment> = self.fragments.iter().collect();
            parts.sort_by_key(|f| (f.order, f.seq));
            let description = parts
                .iter()
                .map(|f| f.html.as_str())
                .collect::<Vec<_>>()
                .join(" ");
            self.output.insert(DESCRIPTION_FIELD.to_string(), description);
        }
        if !self.keywords.is_empty() {
            self.output
                .insert(KEYWORDS_FIELD.to_string(), render_keywords(&self.keywords));
        }
        self.dirty = false;
    }

    pub fn output(&mut self) -> &CanonicalFields {
        self.finalize();
        &self.output
    }

    pub fn consumed(&self) -> &BTreeSet<String> {
        &self.consumed
    }
}

/// One step of a [`RecordLayout`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LayoutRule {
    Field {
        column: String,
        field: String,
    },
    Date {
        column: String,
        field: String,
    },
    Constant {
        field: String,
        value: String,
    },
    DescriptionEntry {
        column: String,
        label: String,
        order: i64,
        #[serde(default)]
        blank: Option<String>,
    },
    DescriptionColumn {
        column: String,
        order: i64,
    },
    DescriptionHtml {
        html: String,
        order: i64,
    },
    Keyword {
        column: String,
        vocabulary: String,
    },
    KeywordList {
        column: String,
    },
    KeywordSplit {
        column: String,
        vocabulary: String,
        #[serde(default = "default_delimiter")]
        delimiter: String,
        #[serde(default)]
        lowercase: bool,
    },
}

fn default_delimiter() -> String {
    ",".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordLayout {
    #[serde(default)]
    pub ignore_values: Vec<String>,
    #[serde(default)]
    pub rules: Vec<LayoutRule>,
}

fn passthrough(column: &str) -> LayoutRule {
    LayoutRule::Field {
        column: column.to_string(),
        field: column.to_string(),
    }
}

impl Default for RecordLayout {
    /// Pass-through layout for rows that already carry canonical columns.
    fn default() -> Self {
        let mut rules: Vec<LayoutRule> = [
            "Title",
            "Author",
            "Dataverse Contact",
            "Dataverse Subject",
            "Publication Citation",
            "Publication URL",
            "Distributor",
            "Time Period Covered Start",
            "Time Period Covered End",
            "Country/Nation",
            "Geographic Coverage",
        ]
        .into_iter()
        .map(passthrough)
        .collect();
        rules.push(LayoutRule::Date {
            column: "Production Date".to_string(),
            field: "Production Date".to_string(),
        });
        rules.push(LayoutRule::DescriptionColumn {
            column: DESCRIPTION_FIELD.to_string(),
            order: 0,
        });
        rules.push(LayoutRule::KeywordList {
            column: KEYWORDS_FIELD.to_string(),
        });
        Self {
            ignore_values: vec!["n/a".to_string()],
            rules,
        }
    }
}

impl RecordLayout {
    pub fn build(&self, row: &SourceRow) -> Result<RecordBuilder, RecordError> {
        let mut builder = RecordBuilder::new(&self.ignore_values);
        for rule in &self.rules {
            match rule {
                LayoutRule::Field { column, field } => builder.single_assign(row, column, field),
                LayoutRule::Date { column, field } => {
                    builder.assign_date(row, column, field);
                }
                LayoutRule::Constant { field, value } => builder.set_field(field, value.clone()),
                LayoutRule::DescriptionEntry {
                    column,
                    label,
                    order,
                    blank,
                } => builder.add_description_entry(row, column, label, *order, blank.as_deref()),
                LayoutRule::DescriptionColumn { column, order } => {
                    if let Some(html) = builder.take(row, column) {
                        builder.add_description_html(html, *order);
                    }
                }
                LayoutRule::DescriptionHtml { html, order } => {
                    builder.add_description_html(html.clone(), *order)
                }
                LayoutRule::Keyword { column, vocabulary } => {
                    builder.add_keyword_entry(row, column, vocabulary)?
                }
                LayoutRule::KeywordList { column } => builder.add_keywords_from(row, column),
                LayoutRule::KeywordSplit {
                    column,
                    vocabulary,
                    delimiter,
                    lowercase,
                } => builder.add_keywords_split(row, column, vocabulary, delimiter, *lowercase)?,
            }
        }
        builder.finalize();
        Ok(builder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, &str)]) -> SourceRow {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn description_follows_declared_order_not_call_order() {
        let mut b = RecordBuilder::new(&[]);
        b.add_description_html("B", 5);
        b.add_description_html("A", 1);
        assert_eq!(b.output()[DESCRIPTION_FIELD], "A B");
    }

    #[test]
    fn equal_orders_keep_declaration_sequence() {
        let mut b = RecordBuilder::new(&[]);
        b.add_description_html("second", 2);
        b.add_description_html("first-of-1", 1);
        b.add_description_html("second-of-1", 1);
        assert_eq!(
            b.output()[DESCRIPTION_FIELD],
            "first-of-1 second-of-1 second"
        );
    }

    #[test]
    fn finalize_is_idempotent() {
        let mut b = RecordBuilder::new(&[]);
        b.add_description_html("<p>x</p>", 1);
        b.add_keyword("subject", "law").expect("keyword");
        let first = b.output().clone();
        let second = b.output().clone();
        assert_eq!(first, second);
        b.finalize();
        assert_eq!(b.output(), &first);
    }

    #[test]
    fn finalize_picks_up_entries_added_after_a_previous_call() {
        let mut b = RecordBuilder::new(&[]);
        b.add_description_html("one", 1);
        b.finalize();
        b.add_description_html("two", 2);
        assert_eq!(b.output()[DESCRIPTION_FIELD], "one two");
    }

    #[test]
    fn keywords_render_sorted_by_vocabulary_then_value() {
        let mut b = RecordBuilder::new(&[]);
        b.add_keyword("state", "Virginia").expect("kw");
        b.add_keyword("name", "Zed").expect("kw");
        b.add_keyword("name", "Abe").expect("kw");
        assert_eq!(
            b.output()[KEYWORDS_FIELD],
            r#"name:"Abe", name:"Zed", state:"Virginia""#
        );
    }

    #[test]
    fn keyword_vocabulary_must_be_lowercase_identifier() {
        let mut b = RecordBuilder::new(&[]);
        assert!(b.add_keyword("Subject", "x").is_err());
        assert!(b.add_keyword("sub ject", "x").is_err());
        assert!(b.add_keyword("", "x").is_err());
        assert!(b.output().is_empty());
    }

    #[test]
    fn consumed_only_lists_columns_actually_read() {
        let input = row(&[
            ("author", "This is the author."),
            ("unusedgeo", "n/a"),
            ("description1", "Description part 1."),
            ("description2", "Description part 2."),
            ("keyword", "drowyekym"),
            ("never", "touched"),
        ]);
        let mut b = RecordBuilder::new(&["N/A".to_string()]);
        b.set_field("Title", "This is the title.");
        b.single_assign(&input, "author", "Author");
        b.single_assign(&input, "unusedgeo", "Geographic Coverage");
        b.add_description_entry(&input, "description2", "Describe again", 2, None);
        b.add_description_entry(&input, "description1", "Describe first", 1, None);
        b.add_description_html("<p>Describe bonus!</p>", 3);
        b.add_keyword_entry(&input, "keyword", "mykeyword").expect("kw");
        b.add_keyword("myotherkeyword", "drowyekrehtoym").expect("kw");
        b.add_description_entry(&input, "missing", "Absent", 4, Some("unknown"));

        let consumed: Vec<&str> = b.consumed().iter().map(String::as_str).collect();
        assert_eq!(consumed, ["author", "description1", "description2", "keyword"]);

        let out = b.output();
        assert!(!out.contains_key("Geographic Coverage"));
        assert_eq!(
            out[DESCRIPTION_FIELD],
            "<p>Describe first: Description part 1. </p> \
             <p>Describe again: Description part 2. </p> \
             <p>Describe bonus!</p> <p>Absent: unknown </p>"
        );
        assert_eq!(
            out[KEYWORDS_FIELD],
            r#"mykeyword:"drowyekym", myotherkeyword:"drowyekrehtoym""#
        );
    }

    #[test]
    fn keyword_list_parser_drops_blank_entries() {
        let parsed = parse_keyword_list(r#"name:"Abe", blank:"", state:"VA","#);
        assert_eq!(
            parsed,
            vec![
                Keyword {
                    vocabulary: "name".to_string(),
                    value: "Abe".to_string()
                },
                Keyword {
                    vocabulary: "state".to_string(),
                    value: "VA".to_string()
                },
            ]
        );
    }

    #[test]
    fn dates_normalize_from_common_shapes() {
        assert_eq!(parse_date("1850-01-02").expect("iso"), "1850-01-02");
        assert_eq!(parse_date("18500102").expect("compact"), "1850-01-02");
        assert_eq!(parse_date("1850").expect("year"), "1850");
        assert_eq!(parse_date("1.8500101E7").expect("sci"), "1850-01-01");
        assert_eq!(parse_date("18500100").expect("zero day"), "1850-01-01");
        assert_eq!(
            parse_date("18500305, 18491231").expect("list"),
            "1849-12-31"
        );
        assert!(parse_date("someday").is_err());
        assert!(parse_date("18501345").is_err());
    }

    #[test]
    fn unparseable_date_falls_back_to_unset() {
        let input = row(&[("when", "soon")]);
        let mut b = RecordBuilder::new(&[]);
        assert!(!b.assign_date(&input, "when", "Production Date"));
        assert!(b.consumed().is_empty());
        assert!(!b.output().contains_key("Production Date"));
    }

    #[test]
    fn default_layout_passes_canonical_rows_through() {
        let input = row(&[
            ("Local ID", "X1"),
            ("Title", "Petition of Jane"),
            ("Description", "<p>Petition subject: Freedom </p>"),
            ("Keywords", r#"state:"VA", name:"Jane""#),
            ("Production Date", "18500102"),
        ]);
        let mut builder = RecordLayout::default().build(&input).expect("build");
        let out = builder.output().clone();
        assert_eq!(out["Title"], "Petition of Jane");
        assert_eq!(out[DESCRIPTION_FIELD], "<p>Petition subject: Freedom </p>");
        assert_eq!(out[KEYWORDS_FIELD], r#"name:"Jane", state:"VA""#);
        assert_eq!(out["Production Date"], "1850-01-02");
        assert!(!builder.consumed().contains("Local ID"));
    }

    #[test]
    fn layout_rules_deserialize_from_toml() {
        let raw = r#"
            ignore_values = ["n/a"]

            [[rules]]
            kind = "description_entry"
            column = "Subject"
            label = "Petition subject"
            order = 2

            [[rules]]
            kind = "keyword"
            column = "State"
            vocabulary = "state"
        "#;
        let layout: RecordLayout = toml::from_str(raw).expect("parse layout");
        assert_eq!(layout.rules.len(), 2);
        let mut b = layout
            .build(&row(&[("Subject", "Freedom"), ("State", "VA")]))
            .expect("build");
        assert_eq!(b.output()[DESCRIPTION_FIELD], "<p>Petition subject: Freedom </p>");
        assert_eq!(b.output()[KEYWORDS_FIELD], r#"state:"VA""#);
    }

    #[test]
    fn split_keyword_rule_adds_one_keyword_per_item() {
        let raw = r#"
            [[rules]]
            kind = "keyword_split"
            column = "Legislative action summary"
            vocabulary = "action"
            lowercase = true

            [[rules]]
            kind = "keyword_split"
            column = "Signatures"
            vocabulary = "signatory"
            delimiter = ";"
        "#;
        let layout: RecordLayout = toml::from_str(raw).expect("parse layout");
        let input = row(&[
            ("Legislative action summary", "Referred, , Tabled, referred"),
            ("Signatures", " Jane Doe ;John Roe;"),
        ]);
        let mut b = layout.build(&input).expect("build");
        assert_eq!(
            b.output()[KEYWORDS_FIELD],
            r#"action:"referred", action:"tabled", signatory:"Jane Doe", signatory:"John Roe""#
        );
        assert!(b.consumed().contains("Legislative action summary"));
        assert!(b.consumed().contains("Signatures"));
    }

    #[test]
    fn split_keyword_rule_rejects_bad_vocabulary() {
        let layout = RecordLayout {
            ignore_values: Vec::new(),
            rules: vec![LayoutRule::KeywordSplit {
                column: "Signatures".to_string(),
                vocabulary: "Not Valid".to_string(),
                delimiter: ",".to_string(),
                lowercase: false,
            }],
        };
        let err = layout
            .build(&row(&[("Signatures", "Jane Doe")]))
            .expect_err("vocabulary");
        assert_eq!(err, RecordError::InvalidVocabulary("Not Valid".to_string()));
    }
}
