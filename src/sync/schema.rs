//! Canonical fields -> repository metadata blocks.
//!
//! Every output field is described by a [`FieldDescriptor`]; one generic
//! assembly walks the descriptors, so adding a field never means adding a new
//! code path.

use crate::sync::record::{CanonicalFields, DESCRIPTION_FIELD, KEYWORDS_FIELD, parse_keyword_list};
use crate::sync::tree::{self, PathError};
use serde_json::{Map, Value, json};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("required field `{field}` is missing for `{type_name}`")]
    MissingField { type_name: String, field: String },
    #[error("builder for `{type_name}` produced a `{produced}` field")]
    BuilderMismatch { type_name: String, produced: String },
    #[error(transparent)]
    Tree(#[from] PathError),
}

#[derive(Debug, Clone)]
pub enum Source {
    Field(String),
    Const(String),
}

#[derive(Debug, Clone)]
pub struct Child {
    pub type_name: String,
    pub source: Source,
}

pub type CustomBuilder = fn(&CanonicalFields) -> Option<Value>;

#[derive(Debug, Clone)]
pub enum FieldDescriptor {
    Direct {
        type_name: String,
        field: String,
        multiple: bool,
        required: bool,
    },
    Compound {
        type_name: String,
        children: Vec<Child>,
        /// Fields that must all be present for the compound to be emitted.
        require: Vec<String>,
        /// Emit one single-key entry per child instead of one entry holding
        /// every child.
        unroll: bool,
        required: bool,
    },
    Custom {
        type_name: String,
        build: CustomBuilder,
    },
}

#[derive(Debug, Clone)]
pub struct Block {
    pub name: String,
    pub display_name: String,
    /// The block is only written when this field is present.
    pub when: Option<String>,
    pub fields: Vec<FieldDescriptor>,
}

#[derive(Debug, Clone)]
pub struct Schema {
    pub blocks: Vec<Block>,
    pub controlled_vocabularies: Vec<String>,
}

fn present<'a>(fields: &'a CanonicalFields, name: &str) -> Option<&'a str> {
    fields
        .get(name)
        .map(String::as_str)
        .filter(|v| !v.trim().is_empty())
}

pub fn field_object(type_name: &str, multiple: bool, type_class: &str, value: Value) -> Value {
    json!({
        "typeName": type_name,
        "multiple": multiple,
        "typeClass": type_class,
        "value": value,
    })
}

fn keyword_field(fields: &CanonicalFields) -> Option<Value> {
    let raw = present(fields, KEYWORDS_FIELD)?;
    let mut entries = parse_keyword_list(raw);
    if entries.is_empty() {
        return None;
    }
    entries.sort();
    let value = entries
        .into_iter()
        .map(|k| {
            json!({
                "keywordVocabulary":
                    field_object("keywordVocabulary", false, "primitive", json!(k.vocabulary)),
                "keywordValue":
                    field_object("keywordValue", false, "primitive", json!(k.value)),
            })
        })
        .collect();
    Some(field_object("keyword", true, "compound", Value::Array(value)))
}

fn date_of_deposit(_fields: &CanonicalFields) -> Option<Value> {
    let today = chrono::Utc::now().format("%Y-%m-%d").to_string();
    Some(field_object("dateOfDeposit", false, "primitive", json!(today)))
}

fn direct(type_name: &str, field: &str, required: bool) -> FieldDescriptor {
    FieldDescriptor::Direct {
        type_name: type_name.to_string(),
        field: field.to_string(),
        multiple: false,
        required,
    }
}

fn child(type_name: &str, source: Source) -> Child {
    Child {
        type_name: type_name.to_string(),
        source,
    }
}

fn col(name: &str) -> Source {
    Source::Field(name.to_string())
}

fn compound(
    type_name: &str,
    children: Vec<Child>,
    require: &[&str],
    required: bool,
) -> FieldDescriptor {
    FieldDescriptor::Compound {
        type_name: type_name.to_string(),
        children,
        require: require.iter().map(|s| s.to_string()).collect(),
        unroll: false,
        required,
    }
}

impl Schema {
    /// Citation and geospatial blocks of a Dataverse dataset version.
    pub fn dataverse(distributor_host: &str) -> Self {
        let citation = Block {
            name: "citation".to_string(),
            display_name: "Citation Metadata".to_string(),
            when: None,
            fields: vec![
                direct("title", "Title", true),
                compound("author", vec![child("authorName", col("Author"))], &["Author"], true),
                compound(
                    "datasetContact",
                    vec![child("datasetContactEmail", col("Dataverse Contact"))],
                    &["Dataverse Contact"],
                    true,
                ),
                compound(
                    "dsDescription",
                    vec![child("dsDescriptionValue", col(DESCRIPTION_FIELD))],
                    &[DESCRIPTION_FIELD],
                    true,
                ),
                FieldDescriptor::Direct {
                    type_name: "subject".to_string(),
                    field: "Dataverse Subject".to_string(),
                    multiple: true,
                    required: false,
                },
                FieldDescriptor::Custom {
                    type_name: "keyword".to_string(),
                    build: keyword_field,
                },
                compound(
                    "publication",
                    vec![
                        child("publicationCitation", col("Publication Citation")),
                        child("publicationURL", col("Publication URL")),
                    ],
                    &["Publication Citation"],
                    false,
                ),
                direct("productionDate", "Production Date", false),
                FieldDescriptor::Compound {
                    type_name: "distributor".to_string(),
                    children: vec![
                        child("distributorName", col("Distributor")),
                        child("distributorName", Source::Const(distributor_host.to_string())),
                    ],
                    require: vec!["Distributor".to_string()],
                    unroll: true,
                    required: false,
                },
                FieldDescriptor::Custom {
                    type_name: "dateOfDeposit".to_string(),
                    build: date_of_deposit,
                },
                compound(
                    "timePeriodCovered",
                    vec![
                        child("timePeriodCoveredStart", col("Time Period Covered Start")),
                        child("timePeriodCoveredEnd", col("Time Period Covered End")),
                    ],
                    &["Time Period Covered Start", "Time Period Covered End"],
                    false,
                ),
            ],
        };
        let geospatial = Block {
            name: "geospatial".to_string(),
            display_name: "Geospatial Metadata".to_string(),
            when: Some("Country/Nation".to_string()),
            fields: vec![compound(
                "geographicCoverage",
                vec![
                    child("country", col("Country/Nation")),
                    child("city", col("Geographic Coverage")),
                ],
                &["Country/Nation"],
                false,
            )],
        };
        Self {
            blocks: vec![citation, geospatial],
            controlled_vocabularies: vec!["country".to_string(), "subject".to_string()],
        }
    }

    fn primitive_class(&self, type_name: &str) -> &'static str {
        if self.controlled_vocabularies.iter().any(|c| c == type_name) {
            "controlledVocabulary"
        } else {
            "primitive"
        }
    }

    fn child_value(&self, child: &Child, fields: &CanonicalFields) -> Option<Value> {
        let raw = match &child.source {
            Source::Field(name) => present(fields, name)?.to_string(),
            Source::Const(value) => value.clone(),
        };
        Some(field_object(
            &child.type_name,
            false,
            self.primitive_class(&child.type_name),
            json!(raw),
        ))
    }

    fn assemble(
        &self,
        descriptor: &FieldDescriptor,
        fields: &CanonicalFields,
    ) -> Result<Option<Value>, SchemaError> {
        match descriptor {
            FieldDescriptor::Direct {
                type_name,
                field,
                multiple,
                required,
            } => {
                let Some(raw) = present(fields, field) else {
                    if *required {
                        return Err(SchemaError::MissingField {
                            type_name: type_name.clone(),
                            field: field.clone(),
                        });
                    }
                    return Ok(None);
                };
                let value = if *multiple { json!([raw]) } else { json!(raw) };
                Ok(Some(field_object(
                    type_name,
                    *multiple,
                    self.primitive_class(type_name),
                    value,
                )))
            }
            FieldDescriptor::Compound {
                type_name,
                children,
                require,
                unroll,
                required,
            } => {
                if let Some(missing) = require.iter().find(|f| present(fields, f).is_none()) {
                    if *required {
                        return Err(SchemaError::MissingField {
                            type_name: type_name.clone(),
                            field: missing.clone(),
                        });
                    }
                    return Ok(None);
                }
                let parts: Vec<(String, Value)> = children
                    .iter()
                    .filter_map(|c| self.child_value(c, fields).map(|v| (c.type_name.clone(), v)))
                    .collect();
                let value = if *unroll {
                    parts
                        .into_iter()
                        .map(|(name, v)| {
                            let mut entry = Map::new();
                            entry.insert(name, v);
                            Value::Object(entry)
                        })
                        .collect()
                } else {
                    vec![Value::Object(parts.into_iter().collect())]
                };
                Ok(Some(field_object(type_name, true, "compound", Value::Array(value))))
            }
            FieldDescriptor::Custom { type_name, build } => {
                let Some(field) = build(fields) else {
                    return Ok(None);
                };
                let produced = field.get("typeName").and_then(Value::as_str).unwrap_or_default();
                if produced != type_name.as_str() {
                    return Err(SchemaError::BuilderMismatch {
                        type_name: type_name.clone(),
                        produced: produced.to_string(),
                    });
                }
                Ok(Some(field))
            }
        }
    }

    /// `{block_name: {displayName, fields}}` for every block that applies.
    pub fn metadata_blocks(
        &self,
        fields: &CanonicalFields,
    ) -> Result<Map<String, Value>, SchemaError> {
        let mut out = Map::new();
        for block in &self.blocks {
            if let Some(gate) = &block.when
                && present(fields, gate).is_none()
            {
                continue;
            }
            let mut assembled = Vec::new();
            for descriptor in &block.fields {
                if let Some(field) = self.assemble(descriptor, fields)? {
                    assembled.push(field);
                }
            }
            out.insert(
                block.name.clone(),
                json!({
                    "displayName": block.display_name,
                    "fields": assembled,
                }),
            );
        }
        Ok(out)
    }

    /// Write the blocks into a dataset version tree and mark it as a new
    /// draft.
    pub fn apply(&self, fields: &CanonicalFields, into: &mut Value) -> Result<(), SchemaError> {
        for (name, block) in self.metadata_blocks(fields)? {
            let base = format!("metadataBlocks/{name}");
            tree::ensure_path(into, &base)?;
            tree::set(into, &format!("{base}/fields"), block["fields"].clone())?;
            tree::set(into, &format!("{base}/displayName"), block["displayName"].clone())?;
        }

        let major = tree::get(into, "versionNumber")?.cloned();
        match major {
            None | Some(Value::Null) => {
                tree::set(into, "versionNumber", json!(1))?;
                tree::set(into, "versionMinorNumber", json!(0))?;
            }
            Some(_) => {
                let minor = tree::get(into, "versionMinorNumber")?.and_then(Value::as_u64);
                let next = minor.map(|m| m + 1).unwrap_or(1);
                tree::set(into, "versionMinorNumber", json!(next))?;
            }
        }
        tree::set(into, "versionState", json!("DRAFT"))?;
        tree::delete(into, "releaseTime");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> CanonicalFields {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn minimal() -> CanonicalFields {
        fields(&[
            ("Title", "Petition of Jane"),
            ("Author", "Jane Doe"),
            ("Dataverse Contact", "archive@example.org"),
            ("Description", "<p>Petition subject: Freedom </p>"),
        ])
    }

    fn find<'a>(fields: &'a [Value], type_name: &str) -> Option<&'a Value> {
        fields.iter().find(|f| f["typeName"] == type_name)
    }

    #[test]
    fn citation_block_assembles_direct_and_compound_fields() {
        let schema = Schema::dataverse("Harvard Dataverse Network");
        let mut input = minimal();
        input.insert("Dataverse Subject".to_string(), "Law".to_string());
        input.insert("Keywords".to_string(), r#"state:"VA", name:"Jane""#.to_string());
        let blocks = schema.metadata_blocks(&input).expect("blocks");
        let citation = blocks["citation"]["fields"].as_array().expect("fields");

        let title = find(citation, "title").expect("title");
        assert_eq!(title["value"], "Petition of Jane");
        assert_eq!(title["typeClass"], "primitive");

        let author = find(citation, "author").expect("author");
        assert_eq!(author["multiple"], true);
        assert_eq!(author["value"][0]["authorName"]["value"], "Jane Doe");

        let subject = find(citation, "subject").expect("subject");
        assert_eq!(subject["typeClass"], "controlledVocabulary");
        assert_eq!(subject["value"], json!(["Law"]));

        let keyword = find(citation, "keyword").expect("keyword");
        assert_eq!(keyword["value"][0]["keywordVocabulary"]["value"], "name");
        assert_eq!(keyword["value"][1]["keywordValue"]["value"], "VA");

        assert!(find(citation, "dateOfDeposit").is_some());
        assert!(find(citation, "publication").is_none());
        assert!(!blocks.contains_key("geospatial"));
    }

    #[test]
    fn unrolled_compound_emits_one_entry_per_child() {
        let schema = Schema::dataverse("Harvard Dataverse Network");
        let mut input = minimal();
        input.insert("Distributor".to_string(), "Digital Library".to_string());
        let blocks = schema.metadata_blocks(&input).expect("blocks");
        let citation = blocks["citation"]["fields"].as_array().expect("fields");
        let distributor = find(citation, "distributor").expect("distributor");
        assert_eq!(
            distributor["value"][0]["distributorName"]["value"],
            "Digital Library"
        );
        assert_eq!(
            distributor["value"][1]["distributorName"]["value"],
            "Harvard Dataverse Network"
        );
    }

    #[test]
    fn geospatial_block_depends_on_country() {
        let schema = Schema::dataverse("host");
        let mut input = minimal();
        input.insert("Country/Nation".to_string(), "United States".to_string());
        let blocks = schema.metadata_blocks(&input).expect("blocks");
        let coverage = &blocks["geospatial"]["fields"][0];
        assert_eq!(coverage["typeName"], "geographicCoverage");
        let entry = coverage["value"][0].as_object().expect("entry");
        assert_eq!(entry.len(), 1);
        assert_eq!(entry["country"]["typeClass"], "controlledVocabulary");
    }

    #[test]
    fn missing_required_field_is_an_error() {
        let schema = Schema::dataverse("host");
        let mut input = minimal();
        input.remove("Author");
        let err = schema.metadata_blocks(&input).expect_err("author required");
        assert!(matches!(err, SchemaError::MissingField { .. }));
    }

    #[test]
    fn custom_builder_must_produce_its_declared_field() {
        fn wrong_name(_fields: &CanonicalFields) -> Option<Value> {
            Some(field_object("subject", false, "primitive", json!("Law")))
        }
        let schema = Schema {
            blocks: vec![Block {
                name: "citation".to_string(),
                display_name: "Citation Metadata".to_string(),
                when: None,
                fields: vec![FieldDescriptor::Custom {
                    type_name: "keyword".to_string(),
                    build: wrong_name,
                }],
            }],
            controlled_vocabularies: Vec::new(),
        };
        let err = schema.metadata_blocks(&minimal()).expect_err("mismatch");
        assert_eq!(
            err,
            SchemaError::BuilderMismatch {
                type_name: "keyword".to_string(),
                produced: "subject".to_string(),
            }
        );
    }

    #[test]
    fn apply_writes_blocks_and_bumps_draft_version() {
        let schema = Schema::dataverse("host");
        let mut snapshot = json!({
            "id": 7,
            "versionNumber": 2,
            "versionMinorNumber": 3,
            "versionState": "RELEASED",
            "releaseTime": "2018-02-01T00:00:00Z",
            "metadataBlocks": {"citation": {"fields": []}}
        });
        schema.apply(&minimal(), &mut snapshot).expect("apply");
        assert_eq!(snapshot["versionMinorNumber"], 4);
        assert_eq!(snapshot["versionNumber"], 2);
        assert_eq!(snapshot["versionState"], "DRAFT");
        assert!(snapshot.get("releaseTime").is_none());
        assert_eq!(snapshot["id"], 7);
        assert_eq!(
            snapshot["metadataBlocks"]["citation"]["displayName"],
            "Citation Metadata"
        );

        let mut fresh = json!({});
        schema.apply(&minimal(), &mut fresh).expect("apply fresh");
        assert_eq!(fresh["versionNumber"], 1);
        assert_eq!(fresh["versionMinorNumber"], 0);
    }
}
