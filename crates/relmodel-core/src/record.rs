//! Record instances.
//!
//! A [`Record`] stores its attributes by slot in its model's column table,
//! next to a snapshot of the attributes as last persisted. Dirty tracking
//! compares the two. Loaded associations live in named slots; a slot that
//! was never loaded is absent, and reading it is a contract violation
//! reported as `NotLoadedAssociation` rather than a hidden query.

use crate::association::{AssociationDescriptor, AssociationKind};
use crate::error::{AssociationErrorKind, Error, Result, TypeError, ValidationError};
use crate::schema::ModelDef;
use crate::value::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// An ordered list of hydrated records.
///
/// Collections produced by preloading are frozen once their level
/// completes; pushing into a frozen collection fails.
#[derive(Debug, Clone, Default)]
pub struct RecordCollection {
    association: String,
    records: Vec<Record>,
    frozen: bool,
}

impl RecordCollection {
    pub fn new(association: impl Into<String>) -> Self {
        Self {
            association: association.into(),
            records: Vec::new(),
            frozen: false,
        }
    }

    pub fn from_records(association: impl Into<String>, records: Vec<Record>) -> Self {
        Self {
            association: association.into(),
            records,
            frozen: false,
        }
    }

    /// Append a record.
    pub fn push(&mut self, record: Record) -> Result<()> {
        if self.frozen {
            return Err(Error::association(
                AssociationErrorKind::FrozenCollection,
                record.model_name(),
                self.association.as_str(),
                "cannot add to a loaded association collection",
            ));
        }
        self.records.push(record);
        Ok(())
    }

    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Record> {
        self.records.get(index)
    }

    pub fn first(&self) -> Option<&Record> {
        self.records.first()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Record> {
        self.records.iter()
    }

    /// Mutable access to members. Membership itself stays fixed once frozen;
    /// this is what nested preloads use to fill the members' own slots.
    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Record> {
        self.records.iter_mut()
    }

    pub fn as_slice(&self) -> &[Record] {
        &self.records
    }
}

impl<'a> IntoIterator for &'a RecordCollection {
    type Item = &'a Record;
    type IntoIter = std::slice::Iter<'a, Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

/// The loaded state of one association on one record.
#[derive(Debug, Clone)]
pub enum AssociationSlot {
    /// Loaded, and nothing matched
    Empty,
    One(Box<Record>),
    Many(RecordCollection),
}

impl AssociationSlot {
    /// Loaded records, in order.
    pub fn records(&self) -> Vec<&Record> {
        match self {
            AssociationSlot::Empty => Vec::new(),
            AssociationSlot::One(record) => vec![record.as_ref()],
            AssociationSlot::Many(collection) => collection.iter().collect(),
        }
    }

    pub fn records_mut(&mut self) -> Vec<&mut Record> {
        match self {
            AssociationSlot::Empty => Vec::new(),
            AssociationSlot::One(record) => vec![record.as_mut()],
            AssociationSlot::Many(collection) => collection.iter_mut().collect(),
        }
    }
}

/// One row of one model, with change tracking and association slots.
#[derive(Debug, Clone)]
pub struct Record {
    model: Arc<ModelDef>,
    values: Vec<Value>,
    persisted_values: Vec<Value>,
    persisted: bool,
    destroyed: bool,
    associations: HashMap<String, AssociationSlot>,
}

impl Record {
    /// A blank, unpersisted record.
    pub fn new(model: &Arc<ModelDef>) -> Self {
        let width = model.columns().len();
        Self {
            model: Arc::clone(model),
            values: vec![Value::Null; width],
            persisted_values: vec![Value::Null; width],
            persisted: false,
            destroyed: false,
            associations: HashMap::new(),
        }
    }

    /// An unpersisted record with the given attributes assigned.
    ///
    /// Fails with `RequiredBelongsTo` when a non-optional BelongsTo foreign
    /// key is left NULL.
    pub fn build<I, K, V>(model: &Arc<ModelDef>, attributes: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Value>,
    {
        Self::build_with(model, attributes, &[])
    }

    /// Like [`build`](Self::build), also pointing BelongsTo associations at
    /// existing records before the foreign keys are checked.
    pub fn build_with<I, K, V>(
        model: &Arc<ModelDef>,
        attributes: I,
        associated: &[(&str, &Record)],
    ) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Value>,
    {
        let mut record = Self::new(model);
        record.assign_attributes(attributes)?;
        for (association, target) in associated {
            record.assign(association, target)?;
        }
        record.validate_belongs_to()?;
        Ok(record)
    }

    /// Set every attribute in `attributes`.
    pub fn assign_attributes<I, K, V>(&mut self, attributes: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Value>,
    {
        for (column, value) in attributes {
            self.set(column.as_ref(), value)?;
        }
        Ok(())
    }

    /// A persisted record whose snapshot equals `values` (slot order).
    pub fn hydrate(model: &Arc<ModelDef>, mut values: Vec<Value>) -> Self {
        values.resize(model.columns().len(), Value::Null);
        Self {
            model: Arc::clone(model),
            persisted_values: values.clone(),
            values,
            persisted: true,
            destroyed: false,
            associations: HashMap::new(),
        }
    }

    pub fn model(&self) -> &Arc<ModelDef> {
        &self.model
    }

    pub fn model_name(&self) -> &str {
        &self.model.name
    }

    /// Current value of a column.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.model.slot_of(column).map(|slot| &self.values[slot])
    }

    /// Value of a column as last persisted.
    pub fn persisted_value(&self, column: &str) -> Option<&Value> {
        self.model
            .slot_of(column)
            .map(|slot| &self.persisted_values[slot])
    }

    /// Assign a column value.
    pub fn set(&mut self, column: &str, value: impl Into<Value>) -> Result<()> {
        let Some(slot) = self.model.slot_of(column) else {
            return Err(Error::Validation(ValidationError {
                model: self.model.name.clone(),
                field: Some(column.to_string()),
                message: format!("unknown attribute '{}'", column),
            }));
        };
        self.values[slot] = value.into();
        Ok(())
    }

    /// The primary-key value (NULL until inserted).
    pub fn id(&self) -> &Value {
        self.get(&self.model.primary_key).unwrap_or(&Value::Null)
    }

    /// Attributes in slot order.
    pub fn attributes(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.model.column_names().zip(self.values.iter())
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn is_persisted(&self) -> bool {
        self.persisted && !self.destroyed
    }

    pub fn is_new_record(&self) -> bool {
        !self.persisted
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Columns whose current value differs from the persisted snapshot.
    pub fn dirty_attributes(&self) -> Vec<&str> {
        self.model
            .columns()
            .iter()
            .filter(|c| self.values[c.slot] != self.persisted_values[c.slot])
            .map(|c| c.name.as_str())
            .collect()
    }

    pub fn is_dirty(&self) -> bool {
        self.values != self.persisted_values
    }

    /// `(column, persisted, current)` for every dirty column.
    pub fn changes(&self) -> Vec<(&str, &Value, &Value)> {
        self.model
            .columns()
            .iter()
            .filter(|c| self.values[c.slot] != self.persisted_values[c.slot])
            .map(|c| {
                (
                    c.name.as_str(),
                    &self.persisted_values[c.slot],
                    &self.values[c.slot],
                )
            })
            .collect()
    }

    /// Snapshot the current attributes as persisted.
    pub fn mark_persisted(&mut self) {
        self.persisted_values.clone_from(&self.values);
        self.persisted = true;
        self.destroyed = false;
    }

    /// Replace every attribute with freshly read values and snapshot them.
    pub fn refresh(&mut self, mut values: Vec<Value>) {
        values.resize(self.model.columns().len(), Value::Null);
        self.values = values;
        self.mark_persisted();
    }

    pub fn mark_destroyed(&mut self) {
        self.destroyed = true;
    }

    /// Point a BelongsTo association at `target`.
    ///
    /// Copies the target's key into the foreign key (and, for polymorphic
    /// edges, its type name into the discriminator), then stores the target
    /// in the association slot.
    pub fn assign(&mut self, association: &str, target: &Record) -> Result<()> {
        let assoc = Arc::clone(self.model.association(association)?);
        if assoc.kind != AssociationKind::BelongsTo || assoc.is_through() {
            return Err(Error::Validation(ValidationError {
                model: self.model.name.clone(),
                field: Some(association.to_string()),
                message: "only BelongsTo associations can be assigned a record".to_string(),
            }));
        }
        if !assoc
            .target
            .candidates()
            .iter()
            .any(|c| *c == target.model.name || c == target.model.polymorphic_name())
        {
            return Err(Error::Validation(ValidationError {
                model: self.model.name.clone(),
                field: Some(association.to_string()),
                message: format!(
                    "{} is not a valid target for '{}'",
                    target.model.name, association
                ),
            }));
        }

        let key_column = assoc.target_column(&target.model.primary_key);
        let key = target.get(key_column).cloned().unwrap_or(Value::Null);
        self.set(assoc.foreign_key_column(), key)?;
        if let Some(discriminator) = assoc.discriminator_column() {
            let type_name = target.model.polymorphic_name().to_string();
            self.set(discriminator, type_name)?;
        }
        self.associations.insert(
            association.to_string(),
            AssociationSlot::One(Box::new(target.clone())),
        );
        Ok(())
    }

    /// Reject NULL foreign keys on non-optional BelongsTo associations.
    pub fn validate_belongs_to(&self) -> Result<()> {
        for assoc in self.model.associations.iter() {
            if assoc.kind != AssociationKind::BelongsTo || assoc.optional || assoc.is_through() {
                continue;
            }
            let missing = self
                .get(assoc.foreign_key_column())
                .is_none_or(Value::is_null);
            if missing {
                return Err(Error::association(
                    AssociationErrorKind::RequiredBelongsTo,
                    self.model.name.as_str(),
                    assoc.name.as_str(),
                    format!("'{}' must exist", assoc.name),
                ));
            }
        }
        Ok(())
    }

    /// Whether an association slot has been loaded.
    pub fn is_loaded(&self, association: &str) -> bool {
        self.associations.contains_key(association)
    }

    /// Read an association slot.
    pub fn association(&self, name: &str) -> Result<&AssociationSlot> {
        if let Some(slot) = self.associations.get(name) {
            return Ok(slot);
        }
        self.model.association(name)?;
        Err(Error::association(
            AssociationErrorKind::NotLoadedAssociation,
            self.model.name.as_str(),
            name,
            format!(
                "association '{}' was not loaded; preload or load it before reading",
                name
            ),
        ))
    }

    /// Read a single-record association.
    pub fn one(&self, name: &str) -> Result<Option<&Record>> {
        match self.association(name)? {
            AssociationSlot::Empty => Ok(None),
            AssociationSlot::One(record) => Ok(Some(record)),
            AssociationSlot::Many(_) => Err(Error::Type(TypeError {
                expected: "single association",
                actual: "collection".to_string(),
                column: Some(name.to_string()),
            })),
        }
    }

    /// Read a collection association.
    pub fn many(&self, name: &str) -> Result<&RecordCollection> {
        match self.association(name)? {
            AssociationSlot::Many(collection) => Ok(collection),
            _ => Err(Error::Type(TypeError {
                expected: "collection association",
                actual: "single record".to_string(),
                column: Some(name.to_string()),
            })),
        }
    }

    pub fn association_mut(&mut self, name: &str) -> Option<&mut AssociationSlot> {
        self.associations.get_mut(name)
    }

    /// Fill an association slot.
    pub fn set_association(&mut self, name: impl Into<String>, slot: AssociationSlot) {
        self.associations.insert(name.into(), slot);
    }

    /// Forget a loaded association.
    pub fn unload(&mut self, name: &str) -> Option<AssociationSlot> {
        self.associations.remove(name)
    }

    /// Forget every loaded association.
    pub fn unload_all(&mut self) {
        self.associations.clear();
    }

    /// Names of loaded associations.
    pub fn loaded_associations(&self) -> impl Iterator<Item = &str> {
        self.associations.keys().map(String::as_str)
    }

    /// Attributes plus loaded associations as a JSON object.
    pub fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for (column, value) in self.attributes() {
            map.insert(column.to_string(), value.to_json());
        }
        for (name, slot) in &self.associations {
            let json = match slot {
                AssociationSlot::Empty => serde_json::Value::Null,
                AssociationSlot::One(record) => record.to_json(),
                AssociationSlot::Many(collection) => {
                    serde_json::Value::Array(collection.iter().map(Record::to_json).collect())
                }
            };
            map.insert(name.clone(), json);
        }
        serde_json::Value::Object(map)
    }
}

/// The key an owner record exposes to `assoc`, and the key its targets
/// must carry to match.
pub fn owner_key<'r>(record: &'r Record, assoc: &AssociationDescriptor) -> &'r Value {
    let column = assoc.owner_column(&record.model.primary_key);
    record.get(column).unwrap_or(&Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::association::AssociationDescriptor;
    use crate::schema::{ModelBuilder, Schema, SchemaBuilder};

    fn schema() -> Arc<Schema> {
        SchemaBuilder::new()
            .model(
                ModelBuilder::new("User")
                    .column("name", "text")
                    .association(AssociationDescriptor::has_many("posts", "Post")),
            )
            .model(
                ModelBuilder::new("Post")
                    .column("userId", "bigint")
                    .column("title", "text")
                    .association(AssociationDescriptor::belongs_to("user", "User")),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn new_records_track_assigned_attributes() {
        let schema = schema();
        let user = Record::build(schema.model("User").unwrap(), [("name", "Ada")]).unwrap();
        assert!(user.is_new_record());
        assert_eq!(user.dirty_attributes(), vec!["name"]);
        assert_eq!(user.id(), &Value::Null);
    }

    #[test]
    fn hydrated_records_are_clean_until_changed() {
        let schema = schema();
        let model = schema.model("User").unwrap();
        let mut user = Record::hydrate(model, vec![Value::BigInt(1), Value::from("Ada")]);
        assert!(user.dirty_attributes().is_empty());
        user.set("name", "Grace").unwrap();
        assert_eq!(user.dirty_attributes(), vec!["name"]);
        assert_eq!(
            user.changes(),
            vec![("name", &Value::from("Ada"), &Value::from("Grace"))]
        );
        user.mark_persisted();
        assert!(!user.is_dirty());
    }

    #[test]
    fn unknown_attribute_is_rejected() {
        let schema = schema();
        let err = Record::build(schema.model("User").unwrap(), [("nope", 1_i64)]).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn assign_copies_key_and_fills_slot() {
        let schema = schema();
        let user = Record::hydrate(
            schema.model("User").unwrap(),
            vec![Value::BigInt(7), Value::from("Ada")],
        );
        let mut post = Record::new(schema.model("Post").unwrap());
        assert_eq!(
            post.validate_belongs_to().unwrap_err().association_kind(),
            Some(AssociationErrorKind::RequiredBelongsTo)
        );
        post.assign("user", &user).unwrap();
        assert_eq!(post.get("userId"), Some(&Value::BigInt(7)));
        assert!(post.validate_belongs_to().is_ok());
        assert_eq!(post.one("user").unwrap().map(Record::id), Some(&Value::BigInt(7)));
    }

    #[test]
    fn build_checks_required_belongs_to() {
        let schema = schema();
        let post = schema.model("Post").unwrap();
        let err = Record::build(post, [("title", "orphan")]).unwrap_err();
        assert_eq!(err.association_kind(), Some(AssociationErrorKind::RequiredBelongsTo));

        let user = Record::hydrate(
            schema.model("User").unwrap(),
            vec![Value::BigInt(3), Value::from("Ada")],
        );
        let built = Record::build_with(post, [("title", "hello")], &[("user", &user)]).unwrap();
        assert_eq!(built.get("userId"), Some(&Value::BigInt(3)));
        assert!(built.is_loaded("user"));
        assert!(Record::build(post, [("userId", 3_i64)]).is_ok());
    }

    #[test]
    fn unloaded_association_access_fails() {
        let schema = schema();
        let user = Record::hydrate(schema.model("User").unwrap(), vec![Value::BigInt(1)]);
        assert_eq!(
            user.many("posts").unwrap_err().association_kind(),
            Some(AssociationErrorKind::NotLoadedAssociation)
        );
        assert_eq!(
            user.many("missing").unwrap_err().association_kind(),
            Some(AssociationErrorKind::MissingAssociation)
        );
    }

    #[test]
    fn frozen_collection_rejects_push() {
        let schema = schema();
        let post = Record::new(schema.model("Post").unwrap());
        let mut posts = RecordCollection::new("posts");
        posts.push(post.clone()).unwrap();
        posts.freeze();
        assert_eq!(
            posts.push(post).unwrap_err().association_kind(),
            Some(AssociationErrorKind::FrozenCollection)
        );
        assert_eq!(posts.len(), 1);
    }

    #[test]
    fn to_json_includes_loaded_associations() {
        let schema = schema();
        let mut user = Record::hydrate(
            schema.model("User").unwrap(),
            vec![Value::BigInt(1), Value::from("Ada")],
        );
        user.set_association("posts", AssociationSlot::Many(RecordCollection::new("posts")));
        let json = user.to_json();
        assert_eq!(json["name"], serde_json::json!("Ada"));
        assert_eq!(json["posts"], serde_json::json!([]));
    }
}
