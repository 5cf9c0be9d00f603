// SPDX-License-Identifier: PMPL-1.0-or-later
//! Schema catalog snapshot.
//!
//! The catalog is supplied by the schema-introspection collaborator and is
//! read-only for the lifetime of a compilation. Relations are stored the way
//! the backend stores its relation rows (many side, one side, optional
//! junction link); the traversal kind of a hop is derived on lookup.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{QueryError, Result};
use crate::path::FieldPath;

/// Semantic type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldType {
    String,
    Text,
    Uuid,
    Hash,
    Integer,
    BigInteger,
    Float,
    Decimal,
    Boolean,
    Date,
    Time,
    DateTime,
    Timestamp,
    Json,
    /// Comma-separated array stored in a single column.
    Csv,
    /// No column; names the to-many side of a relation.
    Alias,
}

impl FieldType {
    /// Types that support pattern matching.
    pub fn is_string_like(self) -> bool {
        matches!(
            self,
            FieldType::String | FieldType::Text | FieldType::Hash | FieldType::Csv
        )
    }

    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            FieldType::Integer | FieldType::BigInteger | FieldType::Float | FieldType::Decimal
        )
    }

    pub fn is_temporal(self) -> bool {
        matches!(
            self,
            FieldType::Date | FieldType::Time | FieldType::DateTime | FieldType::Timestamp
        )
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldType::String => "string",
            FieldType::Text => "text",
            FieldType::Uuid => "uuid",
            FieldType::Hash => "hash",
            FieldType::Integer => "integer",
            FieldType::BigInteger => "bigInteger",
            FieldType::Float => "float",
            FieldType::Decimal => "decimal",
            FieldType::Boolean => "boolean",
            FieldType::Date => "date",
            FieldType::Time => "time",
            FieldType::DateTime => "dateTime",
            FieldType::Timestamp => "timestamp",
            FieldType::Json => "json",
            FieldType::Csv => "csv",
            FieldType::Alias => "alias",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for FieldType {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| QueryError::InvalidSchema(format!("unknown field type: {s}")))
    }
}

/// A single field of a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

fn default_nullable() -> bool {
    true
}

impl Field {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            nullable: true,
        }
    }

    /// Mark the field as `NOT NULL`.
    pub fn required(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Alias fields have no backing column.
    pub fn has_column(&self) -> bool {
        self.field_type != FieldType::Alias
    }
}

/// A queryable table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    pub name: String,
    /// Name of the primary-key field.
    pub primary: String,
    /// Fields in declaration order.
    pub fields: Vec<Field>,
    /// Field used for ordering when a query does not specify a sort.
    #[serde(default)]
    pub sort_field: Option<String>,
}

impl Collection {
    pub fn new(name: impl Into<String>, primary: impl Into<String>, fields: Vec<Field>) -> Self {
        Self {
            name: name.into(),
            primary: primary.into(),
            fields,
            sort_field: None,
        }
    }

    pub fn with_sort_field(mut self, field: impl Into<String>) -> Self {
        self.sort_field = Some(field.into());
        self
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn primary_field(&self) -> Option<&Field> {
        self.field(&self.primary)
    }
}

/// A relation row: `many_collection.many_field` references
/// `one_collection`'s primary key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    pub many_collection: String,
    pub many_field: String,
    pub one_collection: String,
    /// Alias field on the one side exposing the reverse direction.
    #[serde(default)]
    pub one_field: Option<String>,
    /// Set on both halves of a many-to-many pair: the other foreign key of
    /// the junction collection.
    #[serde(default)]
    pub junction_field: Option<String>,
}

impl Relation {
    pub fn many_to_one(
        many_collection: impl Into<String>,
        many_field: impl Into<String>,
        one_collection: impl Into<String>,
    ) -> Self {
        Self {
            many_collection: many_collection.into(),
            many_field: many_field.into(),
            one_collection: one_collection.into(),
            one_field: None,
            junction_field: None,
        }
    }

    /// Expose the reverse (one-to-many) direction under `alias`.
    pub fn with_reverse(mut self, alias: impl Into<String>) -> Self {
        self.one_field = Some(alias.into());
        self
    }

    pub fn with_junction(mut self, junction_field: impl Into<String>) -> Self {
        self.junction_field = Some(junction_field.into());
        self
    }
}

/// One traversal step from a collection through a relational field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RelationHop {
    /// Source row holds `foreign_key`, pointing at `target.target_key`.
    ManyToOne {
        foreign_key: String,
        target: String,
        target_key: String,
    },
    /// `target.foreign_key` points at the source's `source_key`.
    OneToMany {
        source_key: String,
        target: String,
        foreign_key: String,
    },
    /// Source and target are linked through `junction`.
    ManyToMany {
        source_key: String,
        junction: String,
        junction_source: String,
        junction_target: String,
        target: String,
        target_key: String,
    },
}

impl RelationHop {
    pub fn target(&self) -> &str {
        match self {
            RelationHop::ManyToOne { target, .. }
            | RelationHop::OneToMany { target, .. }
            | RelationHop::ManyToMany { target, .. } => target,
        }
    }

    /// Whether following the hop can multiply source rows.
    pub fn is_to_many(&self) -> bool {
        !matches!(self, RelationHop::ManyToOne { .. })
    }
}

/// Serialized form of the catalog.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    pub collections: Vec<Collection>,
    #[serde(default)]
    pub relations: Vec<Relation>,
}

/// Immutable, validated catalog of collections and relations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "SchemaSnapshot", into = "SchemaSnapshot")]
pub struct SchemaCatalog {
    collections: BTreeMap<String, Collection>,
    relations: Vec<Relation>,
}

impl TryFrom<SchemaSnapshot> for SchemaCatalog {
    type Error = QueryError;

    fn try_from(snapshot: SchemaSnapshot) -> Result<Self> {
        SchemaCatalog::new(snapshot.collections, snapshot.relations)
    }
}

impl From<SchemaCatalog> for SchemaSnapshot {
    fn from(catalog: SchemaCatalog) -> Self {
        SchemaSnapshot {
            collections: catalog.collections.into_values().collect(),
            relations: catalog.relations,
        }
    }
}

impl SchemaCatalog {
    /// Build a catalog, rejecting dangling or inconsistent references.
    pub fn new(collections: Vec<Collection>, relations: Vec<Relation>) -> Result<Self> {
        let mut map = BTreeMap::new();
        for collection in collections {
            let mut seen = HashSet::new();
            for field in &collection.fields {
                if !seen.insert(field.name.as_str()) {
                    return Err(QueryError::InvalidSchema(format!(
                        "duplicate field \"{}\" in collection \"{}\"",
                        field.name, collection.name
                    )));
                }
            }
            match collection.primary_field() {
                Some(pk) if pk.has_column() => {}
                _ => {
                    return Err(QueryError::InvalidSchema(format!(
                        "collection \"{}\" has no primary key field \"{}\"",
                        collection.name, collection.primary
                    )))
                }
            }
            if let Some(sort) = &collection.sort_field {
                if collection.field(sort).is_none() {
                    return Err(QueryError::InvalidSchema(format!(
                        "sort field \"{}\" missing from collection \"{}\"",
                        sort, collection.name
                    )));
                }
            }
            if map.insert(collection.name.clone(), collection).is_some() {
                return Err(QueryError::InvalidSchema("duplicate collection".to_string()));
            }
        }

        let catalog = Self {
            collections: map,
            relations,
        };
        for relation in &catalog.relations {
            catalog.check_relation(relation)?;
        }
        Ok(catalog)
    }

    /// Parse a catalog from its JSON snapshot form.
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: SchemaSnapshot = serde_json::from_str(json)
            .map_err(|e| QueryError::InvalidSchema(e.to_string()))?;
        Self::try_from(snapshot)
    }

    fn check_relation(&self, relation: &Relation) -> Result<()> {
        let dangling = |what: String| {
            Err(QueryError::InvalidSchema(format!(
                "relation {}.{} references {}",
                relation.many_collection, relation.many_field, what
            )))
        };

        let Some(many) = self.collection(&relation.many_collection) else {
            return dangling(format!("missing collection \"{}\"", relation.many_collection));
        };
        if many.field(&relation.many_field).map(Field::has_column) != Some(true) {
            return dangling(format!("missing column \"{}\"", relation.many_field));
        }
        let Some(one) = self.collection(&relation.one_collection) else {
            return dangling(format!("missing collection \"{}\"", relation.one_collection));
        };
        if let Some(alias) = &relation.one_field {
            if one.field(alias).map(|f| f.field_type) != Some(FieldType::Alias) {
                return dangling(format!("missing alias field \"{}.{}\"", one.name, alias));
            }
        }
        if let Some(junction_field) = &relation.junction_field {
            let sibling = self.relations.iter().any(|r| {
                r.many_collection == relation.many_collection && &r.many_field == junction_field
            });
            if !sibling {
                return dangling(format!(
                    "junction field \"{}\" without a matching relation",
                    junction_field
                ));
            }
        }
        Ok(())
    }

    pub fn collection(&self, name: &str) -> Option<&Collection> {
        self.collections.get(name)
    }

    pub fn collections(&self) -> impl Iterator<Item = &Collection> {
        self.collections.values()
    }

    pub fn relations(&self) -> &[Relation] {
        &self.relations
    }

    /// Relations in which `collection` takes part on either side.
    pub fn relations_of<'a>(&'a self, collection: &'a str) -> impl Iterator<Item = &'a Relation> {
        self.relations
            .iter()
            .filter(move |r| r.many_collection == collection || r.one_collection == collection)
    }

    /// Resolve the hop taken by following `field` out of `collection`.
    ///
    /// Returns `None` for plain columns and unknown fields.
    pub fn hop(&self, collection: &str, field: &str) -> Option<RelationHop> {
        if let Some(rel) = self
            .relations
            .iter()
            .find(|r| r.many_collection == collection && r.many_field == field)
        {
            let target = self.collection(&rel.one_collection)?;
            return Some(RelationHop::ManyToOne {
                foreign_key: rel.many_field.clone(),
                target: target.name.clone(),
                target_key: target.primary.clone(),
            });
        }

        let rel = self.relations.iter().find(|r| {
            r.one_collection == collection && r.one_field.as_deref() == Some(field)
        })?;
        let source_key = self.collection(collection)?.primary.clone();

        match &rel.junction_field {
            None => Some(RelationHop::OneToMany {
                source_key,
                target: rel.many_collection.clone(),
                foreign_key: rel.many_field.clone(),
            }),
            Some(junction_field) => {
                let sibling = self.relations.iter().find(|r| {
                    r.many_collection == rel.many_collection && &r.many_field == junction_field
                })?;
                let target = self.collection(&sibling.one_collection)?;
                Some(RelationHop::ManyToMany {
                    source_key,
                    junction: rel.many_collection.clone(),
                    junction_source: rel.many_field.clone(),
                    junction_target: junction_field.clone(),
                    target: target.name.clone(),
                    target_key: target.primary.clone(),
                })
            }
        }
    }
}

/// One relation hop taken while walking a dot-path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathStep {
    /// Collection the hop starts from.
    pub collection: String,
    /// Relational field followed.
    pub field: String,
    pub hop: RelationHop,
}

/// A dot-path resolved against the catalog.
#[derive(Debug, Clone)]
pub struct ResolvedPath<'a> {
    pub steps: Vec<PathStep>,
    /// Collection owning the terminal segment.
    pub collection: &'a Collection,
    /// Terminal field; `None` for `*`.
    pub field: Option<&'a Field>,
}

impl ResolvedPath<'_> {
    /// Whether any hop along the path can multiply rows.
    pub fn through_to_many(&self) -> bool {
        self.steps.iter().any(|s| s.hop.is_to_many())
    }

    /// Whether the terminal field is a to-many alias.
    pub fn ends_to_many(&self) -> bool {
        self.field.map(|f| !f.has_column()).unwrap_or(false)
    }
}

impl SchemaCatalog {
    /// Walk `path` from `root`, following one relation per non-terminal
    /// segment.
    pub fn walk(&self, root: &str, path: &FieldPath) -> Result<ResolvedPath<'_>> {
        let unknown = || QueryError::UnknownField {
            collection: root.to_string(),
            path: path.to_string(),
        };

        let mut current = self
            .collection(root)
            .ok_or_else(|| QueryError::invalid(format!("unknown collection \"{root}\"")))?;
        let mut steps = Vec::with_capacity(path.depth());

        for segment in path.parents() {
            current.field(segment).ok_or_else(unknown)?;
            let hop = self.hop(&current.name, segment).ok_or_else(unknown)?;
            let next = self.collection(hop.target()).ok_or_else(unknown)?;
            steps.push(PathStep {
                collection: current.name.clone(),
                field: segment.clone(),
                hop,
            });
            current = next;
        }

        let field = if path.is_wildcard() {
            None
        } else {
            Some(current.field(path.last()).ok_or_else(unknown)?)
        };

        Ok(ResolvedPath {
            steps,
            collection: current,
            field,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn articles_catalog() -> SchemaCatalog {
        SchemaCatalog::new(
            vec![
                Collection::new(
                    "articles",
                    "id",
                    vec![
                        Field::new("id", FieldType::Integer).required(),
                        Field::new("title", FieldType::String),
                        Field::new("author", FieldType::Uuid),
                        Field::new("tags", FieldType::Alias),
                    ],
                ),
                Collection::new(
                    "users",
                    "id",
                    vec![
                        Field::new("id", FieldType::Uuid).required(),
                        Field::new("articles", FieldType::Alias),
                    ],
                ),
                Collection::new(
                    "tags",
                    "id",
                    vec![Field::new("id", FieldType::Integer), Field::new("label", FieldType::String)],
                ),
                Collection::new(
                    "articles_tags",
                    "id",
                    vec![
                        Field::new("id", FieldType::Integer),
                        Field::new("articles_id", FieldType::Integer),
                        Field::new("tags_id", FieldType::Integer),
                    ],
                ),
            ],
            vec![
                Relation::many_to_one("articles", "author", "users").with_reverse("articles"),
                Relation::many_to_one("articles_tags", "articles_id", "articles")
                    .with_reverse("tags")
                    .with_junction("tags_id"),
                Relation::many_to_one("articles_tags", "tags_id", "tags").with_junction("articles_id"),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_many_to_one_hop() {
        let catalog = articles_catalog();
        let hop = catalog.hop("articles", "author").unwrap();
        assert_eq!(
            hop,
            RelationHop::ManyToOne {
                foreign_key: "author".into(),
                target: "users".into(),
                target_key: "id".into(),
            }
        );
        assert!(!hop.is_to_many());
    }

    #[test]
    fn test_reverse_hop_is_one_to_many() {
        let catalog = articles_catalog();
        let hop = catalog.hop("users", "articles").unwrap();
        assert_eq!(hop.target(), "articles");
        assert!(matches!(hop, RelationHop::OneToMany { ref foreign_key, .. } if foreign_key == "author"));
    }

    #[test]
    fn test_junction_hop_is_many_to_many() {
        let catalog = articles_catalog();
        match catalog.hop("articles", "tags").unwrap() {
            RelationHop::ManyToMany {
                junction,
                junction_source,
                junction_target,
                target,
                ..
            } => {
                assert_eq!(junction, "articles_tags");
                assert_eq!(junction_source, "articles_id");
                assert_eq!(junction_target, "tags_id");
                assert_eq!(target, "tags");
            }
            other => panic!("unexpected hop {other:?}"),
        }
    }

    #[test]
    fn test_plain_column_has_no_hop() {
        assert!(articles_catalog().hop("articles", "title").is_none());
    }

    #[test]
    fn test_dangling_relation_rejected() {
        let result = SchemaCatalog::new(
            vec![Collection::new("a", "id", vec![Field::new("id", FieldType::Integer)])],
            vec![Relation::many_to_one("a", "id", "missing")],
        );
        assert!(matches!(result, Err(QueryError::InvalidSchema(_))));
    }

    #[test]
    fn test_missing_primary_rejected() {
        let result = SchemaCatalog::new(
            vec![Collection::new("a", "id", vec![Field::new("name", FieldType::String)])],
            vec![],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_catalog_json_roundtrip() {
        let catalog = articles_catalog();
        let json = serde_json::to_string(&catalog).unwrap();
        let parsed = SchemaCatalog::from_json(&json).unwrap();
        assert_eq!(parsed, catalog);
    }

    #[test]
    fn test_walk_path() {
        let catalog = articles_catalog();
        let path = FieldPath::parse("author.articles.title").unwrap();
        let resolved = catalog.walk("articles", &path).unwrap();
        assert_eq!(resolved.steps.len(), 2);
        assert_eq!(resolved.collection.name, "articles");
        assert!(resolved.through_to_many());

        let wildcard = catalog.walk("articles", &FieldPath::parse("tags.*").unwrap()).unwrap();
        assert_eq!(wildcard.collection.name, "tags");
        assert!(wildcard.field.is_none());
    }

    #[test]
    fn test_walk_unknown_field() {
        let catalog = articles_catalog();
        let err = catalog
            .walk("articles", &FieldPath::parse("title.length").unwrap())
            .unwrap_err();
        assert_eq!(
            err,
            QueryError::UnknownField {
                collection: "articles".into(),
                path: "title.length".into(),
            }
        );
    }

    #[test]
    fn test_field_type_parse() {
        assert_eq!("dateTime".parse::<FieldType>().unwrap(), FieldType::DateTime);
        assert!("blob".parse::<FieldType>().is_err());
    }
}
