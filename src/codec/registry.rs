//! Entity descriptors and the registry shared by every codec instance.
//!
//! A descriptor names an entity type id, its layout kind and its fields.
//! Inheritance is expressed through [`EntityDescriptor::extends`]: at
//! registration the base type's field groups are appended after the
//! entity's own group, so encoders and decoders only ever see one flat
//! field list.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::value::{Entity, EntityKind, Value, LIST_TYPE_ID, MAP_TYPE_ID};
use super::wire::{WireReader, WireWriter};
use super::wire_type::WireType;
use crate::error::WireError;

/// One declared field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    /// Field number written before keyed values.
    pub number: u32,
    pub name: String,
    /// Tag the value must carry, or [`WireType::RunTime`] for any.
    pub wire_type: WireType,
}

/// Fields contributed by one type in an inheritance chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldGroup {
    pub owner: u32,
    pub fields: Vec<FieldDef>,
}

/// Encodes and decodes the body of a CUSTOM entity.
pub trait TypeCodec: Send + Sync + 'static {
    /// Write the body of `entity` (the type id is already written).
    fn encode(&self, entity: &Entity, out: &mut WireWriter<'_>) -> Result<(), WireError>;

    /// Read a body previously written by [`encode`](TypeCodec::encode).
    fn decode(&self, type_id: u32, input: &mut WireReader<'_>) -> Result<Vec<Value>, WireError>;
}

/// Layout of one entity type.
#[derive(Clone)]
pub struct EntityDescriptor {
    type_id: u32,
    name: String,
    kind: EntityKind,
    base: Option<u32>,
    groups: Vec<FieldGroup>,
    codec: Option<Arc<dyn TypeCodec>>,
}

impl fmt::Debug for EntityDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityDescriptor")
            .field("type_id", &self.type_id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("base", &self.base)
            .field("groups", &self.groups)
            .field("custom", &self.codec.is_some())
            .finish()
    }
}

impl EntityDescriptor {
    fn with_kind(kind: EntityKind, type_id: u32, name: impl Into<String>) -> Self {
        Self {
            type_id,
            name: name.into(),
            kind,
            base: None,
            groups: vec![FieldGroup {
                owner: type_id,
                fields: Vec::new(),
            }],
            codec: None,
        }
    }

    /// Entity written as `(field number, value)` pairs.
    pub fn keyed(type_id: u32, name: impl Into<String>) -> Self {
        Self::with_kind(EntityKind::Keyed, type_id, name)
    }

    /// Entity written positionally.
    pub fn indexed(type_id: u32, name: impl Into<String>) -> Self {
        Self::with_kind(EntityKind::Indexed, type_id, name)
    }

    /// Entity whose body is produced by `codec`.
    pub fn custom<C: TypeCodec>(type_id: u32, name: impl Into<String>, codec: C) -> Self {
        let mut desc = Self::with_kind(EntityKind::Custom, type_id, name);
        desc.codec = Some(Arc::new(codec));
        desc
    }

    /// Declare a field on this type's own group.
    pub fn field(mut self, number: u32, name: impl Into<String>, wire_type: WireType) -> Self {
        self.groups[0].fields.push(FieldDef {
            number,
            name: name.into(),
            wire_type,
        });
        self
    }

    /// Inherit the fields of an already-registered type.
    pub fn extends(mut self, base_type_id: u32) -> Self {
        self.base = Some(base_type_id);
        self
    }

    pub fn type_id(&self) -> u32 {
        self.type_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn base(&self) -> Option<u32> {
        self.base
    }

    pub fn groups(&self) -> &[FieldGroup] {
        &self.groups
    }

    /// All fields, own group first.
    pub fn fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.groups.iter().flat_map(|g| g.fields.iter())
    }

    pub fn field_count(&self) -> usize {
        self.groups.iter().map(|g| g.fields.len()).sum()
    }

    /// Flattened index of a field number.
    pub fn index_of(&self, number: u32) -> Option<usize> {
        self.fields().position(|f| f.number == number)
    }

    pub(crate) fn codec(&self) -> Option<&Arc<dyn TypeCodec>> {
        self.codec.as_ref()
    }

    /// Build an entity value of this type, checking the field count.
    pub fn instance(&self, fields: Vec<Value>) -> Result<Value, WireError> {
        if self.kind != EntityKind::Custom && fields.len() > self.field_count() {
            return Err(WireError::EntityLayout {
                type_id: self.type_id,
                reason: format!(
                    "{} values for {} declared fields",
                    fields.len(),
                    self.field_count()
                ),
            });
        }
        Ok(Value::Entity(Entity::new(self.kind, self.type_id, fields)))
    }
}

/// Lookup from type id to descriptor.
///
/// Built once at startup, then shared behind an `Arc` by every session.
#[derive(Debug, Clone)]
pub struct EntityRegistry {
    descriptors: HashMap<u32, Arc<EntityDescriptor>>,
}

impl Default for EntityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityRegistry {
    /// Registry holding the built-in list and map codecs.
    pub fn new() -> Self {
        let mut descriptors = HashMap::new();
        descriptors.insert(
            LIST_TYPE_ID,
            Arc::new(EntityDescriptor::custom(LIST_TYPE_ID, "list", ListCodec)),
        );
        descriptors.insert(
            MAP_TYPE_ID,
            Arc::new(EntityDescriptor::custom(MAP_TYPE_ID, "map", MapCodec)),
        );
        Self { descriptors }
    }

    /// Register a descriptor, resolving its base type.
    ///
    /// # Errors
    ///
    /// Fails on a duplicate type id, an unknown or incompatible base, or a
    /// field number declared twice across the flattened chain.
    pub fn register(&mut self, mut desc: EntityDescriptor) -> Result<(), WireError> {
        if self.descriptors.contains_key(&desc.type_id) {
            return Err(WireError::Registry(format!(
                "type id {} already registered",
                desc.type_id
            )));
        }

        if let Some(base_id) = desc.base {
            let base = self.descriptors.get(&base_id).ok_or_else(|| {
                WireError::Registry(format!(
                    "type {} extends unregistered type {}",
                    desc.type_id, base_id
                ))
            })?;
            if desc.kind == EntityKind::Custom || base.kind != desc.kind {
                return Err(WireError::Registry(format!(
                    "type {} ({:?}) cannot extend type {} ({:?})",
                    desc.type_id, desc.kind, base_id, base.kind
                )));
            }
            desc.groups.extend(base.groups.iter().cloned());
        }

        let mut seen = std::collections::HashSet::new();
        for field in desc.fields() {
            if !seen.insert(field.number) {
                return Err(WireError::Registry(format!(
                    "type {} declares field number {} twice",
                    desc.type_id, field.number
                )));
            }
        }

        tracing::debug!(
            type_id = desc.type_id,
            name = %desc.name,
            fields = desc.field_count(),
            "registered entity type"
        );
        self.descriptors.insert(desc.type_id, Arc::new(desc));
        Ok(())
    }

    pub fn get(&self, type_id: u32) -> Option<&Arc<EntityDescriptor>> {
        self.descriptors.get(&type_id)
    }

    /// Descriptor lookup that fails with [`WireError::UnknownEntity`].
    pub fn require(&self, type_id: u32) -> Result<&Arc<EntityDescriptor>, WireError> {
        self.get(type_id).ok_or(WireError::UnknownEntity(type_id))
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

/// Built-in codec for [`Value::list`]: a count, then tagged items.
pub struct ListCodec;

impl TypeCodec for ListCodec {
    fn encode(&self, entity: &Entity, out: &mut WireWriter<'_>) -> Result<(), WireError> {
        out.write_len(entity.fields.len())?;
        for item in &entity.fields {
            out.write_value(item)?;
        }
        Ok(())
    }

    fn decode(&self, _type_id: u32, input: &mut WireReader<'_>) -> Result<Vec<Value>, WireError> {
        let count = input.read_len(1)?;
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(input.read_value()?);
        }
        Ok(items)
    }
}

/// Built-in codec for [`Value::map`]: a pair count, then key/value pairs.
pub struct MapCodec;

impl TypeCodec for MapCodec {
    fn encode(&self, entity: &Entity, out: &mut WireWriter<'_>) -> Result<(), WireError> {
        if entity.fields.len() % 2 != 0 {
            return Err(WireError::EntityLayout {
                type_id: entity.type_id,
                reason: "map needs an even number of fields".to_string(),
            });
        }
        out.write_len(entity.fields.len() / 2)?;
        for item in &entity.fields {
            out.write_value(item)?;
        }
        Ok(())
    }

    fn decode(&self, _type_id: u32, input: &mut WireReader<'_>) -> Result<Vec<Value>, WireError> {
        let pairs = input.read_len(2)?;
        let mut fields = Vec::with_capacity(pairs * 2);
        for _ in 0..pairs * 2 {
            fields.push(input.read_value()?);
        }
        Ok(fields)
    }
}
