//! The record-type descriptor data model (spec §3).
//!
//! This is the consumed-read-only boundary: a real deployment supplies an
//! implementation of [`RecordTypeLibrary`] built once and held immutable for
//! the process lifetime (e.g. parsed from an external schema DSL, the way
//! the teacher's `caliber-dsl` parses CALIBER's configuration language —
//! that parsing step is out of scope here). The planner and query-tree
//! builder only ever read through this trait.

use std::collections::HashMap;
use std::sync::Arc;

use bitflags::bitflags;
use serde_json::Value;

use crate::error::{PlanError, PlanResult};

/// The structural shape of a property: a single value, an ordered list, or
/// a keyed map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructuralKind {
    Scalar,
    Array,
    Map,
}

/// The scalar value type carried by a property (meaningless for `Array`
/// structural kind beyond describing the element type).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueType {
    String,
    Number,
    Boolean,
    DateTime,
    /// A reference to another record type, by id.
    Ref(String),
    /// A nested object (own container, further properties).
    Object,
}

/// Where a property's data physically lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageShape {
    InlineColumn,
    ChildTable,
    LinkTable,
    View,
    Calculated,
    ReverseReference,
}

/// How a property's value is produced on insert.
#[derive(Clone)]
pub enum Generator {
    /// No generator: the value must be supplied by the client.
    None,
    /// Driver-generated (e.g. a `SERIAL`/`IDENTITY` column); the driver
    /// reports the new value back via `RETURNING`.
    Auto,
    /// A user-supplied function, invoked before the INSERT; may be async.
    Function(Arc<dyn IdGenerator>),
}

impl std::fmt::Debug for Generator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Generator::None => write!(f, "Generator::None"),
            Generator::Auto => write!(f, "Generator::Auto"),
            Generator::Function(_) => write!(f, "Generator::Function(..)"),
        }
    }
}

/// A user-supplied id/value generator function, called by the [`Generator`]
/// command before an INSERT that needs it.
#[async_trait::async_trait]
pub trait IdGenerator: Send + Sync {
    async fn generate(&self, record: &Value) -> PlanResult<Value>;
}

bitflags! {
    /// Property-level flags (spec §3).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PropertyFlags: u16 {
        const OPTIONAL          = 0b0000_0001;
        const ID                = 0b0000_0010;
        const RECORD_META_INFO  = 0b0000_0100;
        const VIEW              = 0b0000_1000;
        const CALCULATED        = 0b0001_0000;
        const ENTANGLED         = 0b0010_0000;
        const WEAK_DEPENDENCY   = 0b0100_0000;
        const POLYMORPHIC       = 0b1000_0000;
    }
}

bitflags! {
    /// Per-clause usage flags tracked on properties-tree nodes (spec §3 I1–I3).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct UsageFlags: u8 {
        const SELECT    = 0b0_0001;
        const WHERE     = 0b0_0010;
        const ORDER_BY  = 0b0_0100;
        const DELETE    = 0b0_1000;
        const UPDATE    = 0b1_0000;
    }
}

/// The clause a properties tree is being built for (spec §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Clause {
    Select,
    Where,
    Order,
    Delete,
    Update,
}

impl Clause {
    pub fn usage_flag(self) -> UsageFlags {
        match self {
            Clause::Select => UsageFlags::SELECT,
            Clause::Where => UsageFlags::WHERE,
            Clause::Order => UsageFlags::ORDER_BY,
            Clause::Delete => UsageFlags::DELETE,
            Clause::Update => UsageFlags::UPDATE,
        }
    }
}

/// Child-table layout metadata for a property stored outside the parent's
/// main table.
#[derive(Debug, Clone, Default)]
pub struct ChildTableLayout {
    pub table: String,
    /// Column in the child table holding the parent's id.
    pub parent_id_column: String,
    /// For array collections: the per-element ordering column.
    pub index_column: Option<String>,
    /// For map collections: the per-entry key column and its value type.
    pub key_column: Option<String>,
    pub key_value_type: Option<ValueType>,
}

/// A single property's metadata.
#[derive(Debug, Clone)]
pub struct PropertyDescriptor {
    pub name: String,
    pub structural_kind: StructuralKind,
    pub value_type: ValueType,
    pub storage_shape: StorageShape,
    pub generator: Generator,
    pub flags: PropertyFlags,
    pub child_table: Option<ChildTableLayout>,
    /// Column name when `storage_shape == InlineColumn`.
    pub column: Option<String>,
    /// Nested properties for `ValueType::Object` (inline or child-table
    /// objects/arrays/maps of objects).
    pub nested: Option<Arc<RecordContainer>>,
    /// Subtype extensions, populated when `POLYMORPHIC` is set. Empty for
    /// every other property.
    pub subtypes: Vec<SubtypeDescriptor>,
}

impl PropertyDescriptor {
    pub fn is_optional(&self) -> bool {
        self.flags.contains(PropertyFlags::OPTIONAL)
    }
    pub fn is_id(&self) -> bool {
        self.flags.contains(PropertyFlags::ID)
    }
    pub fn is_calculated(&self) -> bool {
        self.flags.contains(PropertyFlags::CALCULATED)
    }
    pub fn is_view(&self) -> bool {
        self.flags.contains(PropertyFlags::VIEW)
    }
    pub fn is_entangled(&self) -> bool {
        self.flags.contains(PropertyFlags::ENTANGLED)
    }
    pub fn is_weak_dependency(&self) -> bool {
        self.flags.contains(PropertyFlags::WEAK_DEPENDENCY)
    }
    pub fn is_polymorphic(&self) -> bool {
        self.flags.contains(PropertyFlags::POLYMORPHIC)
    }

    /// Whether `*` expansion picks this property up by default (spec §4.2):
    /// scalar-column, nested object, or reverse-ref.
    pub fn fetchable_by_default(&self) -> bool {
        !self.is_calculated()
            && matches!(
                self.storage_shape,
                StorageShape::InlineColumn
                    | StorageShape::ChildTable
                    | StorageShape::LinkTable
                    | StorageShape::ReverseReference
            )
    }

    pub fn is_scalar_intermediate_ok(&self) -> bool {
        matches!(self.structural_kind, StructuralKind::Scalar)
            && matches!(self.value_type, ValueType::Object)
    }
}

/// A container of properties: either a record type's own top-level
/// properties, or a nested object's properties (spec GLOSSARY "Container").
#[derive(Debug, Clone, Default)]
pub struct RecordContainer {
    pub properties: Vec<PropertyDescriptor>,
}

impl RecordContainer {
    pub fn get(&self, name: &str) -> Option<&PropertyDescriptor> {
        self.properties.iter().find(|p| p.name == name)
    }
}

/// Meta-info property names (version/creation/modification), if the record
/// type carries them.
#[derive(Debug, Clone, Default)]
pub struct MetaInfoMapping {
    pub version: Option<String>,
    pub creation_timestamp: Option<String>,
    pub creation_actor: Option<String>,
    pub modification_timestamp: Option<String>,
    pub modification_actor: Option<String>,
}

/// A polymorphic subtype extension of a record type.
#[derive(Debug, Clone)]
pub struct SubtypeDescriptor {
    pub name: String,
    /// `None` means the subtype's properties fold into the base container
    /// rather than living in their own extension table.
    pub extension_table: Option<String>,
    pub extension_id_column: Option<String>,
    pub container: Arc<RecordContainer>,
}

/// Full metadata for one record type.
#[derive(Debug, Clone)]
pub struct RecordTypeDescriptor {
    pub name: String,
    pub main_table: String,
    pub id_property: String,
    pub container: Arc<RecordContainer>,
    pub meta_info: Option<MetaInfoMapping>,
    pub subtypes: Vec<SubtypeDescriptor>,
    pub discriminator_property: Option<String>,
    /// The synthetic parent type's own properties (spec §3), e.g. aggregate
    /// properties over "the collection of records of type X". `None` when
    /// the type declares no super-properties.
    pub super_container: Option<Arc<RecordContainer>>,
}

impl RecordTypeDescriptor {
    pub fn id_descriptor(&self) -> PlanResult<&PropertyDescriptor> {
        self.container
            .get(&self.id_property)
            .ok_or_else(|| PlanError::usage(format!("record type {} has no id property", self.name)))
    }

    pub fn subtype(&self, name: &str) -> Option<&SubtypeDescriptor> {
        self.subtypes.iter().find(|s| s.name == name)
    }

    /// Child tables reachable one level down, with whether the dependency
    /// is weak (spec §4.11 delete planner: weak dependents are excluded
    /// from the cascade).
    pub fn direct_child_tables(&self) -> Vec<(&PropertyDescriptor, bool)> {
        self.container
            .properties
            .iter()
            .filter(|p| {
                matches!(
                    p.storage_shape,
                    StorageShape::ChildTable | StorageShape::LinkTable
                )
            })
            .map(|p| (p, p.is_weak_dependency()))
            .collect()
    }
}

/// The external, read-only schema catalog (spec §6 "Record-types library
/// interface").
pub trait RecordTypeLibrary: Send + Sync {
    fn has_record_type(&self, name: &str) -> bool;
    fn get_record_type_desc(&self, name: &str) -> PlanResult<Arc<RecordTypeDescriptor>>;

    /// Coerce a reference string `TypeName#id` into the target's id value.
    /// Fails with `InvalidReference` on type mismatch.
    fn ref_to_id(&self, type_name: &str, reference: &str) -> PlanResult<Value>;
}

/// A simple in-memory [`RecordTypeLibrary`] used by tests and as a
/// reference implementation for wiring the engine up.
#[derive(Default)]
pub struct StaticLibrary {
    types: HashMap<String, Arc<RecordTypeDescriptor>>,
}

impl StaticLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, desc: RecordTypeDescriptor) {
        self.types.insert(desc.name.clone(), Arc::new(desc));
    }
}

impl RecordTypeLibrary for StaticLibrary {
    fn has_record_type(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    fn get_record_type_desc(&self, name: &str) -> PlanResult<Arc<RecordTypeDescriptor>> {
        self.types
            .get(name)
            .cloned()
            .ok_or_else(|| PlanError::usage(format!("unknown record type: {name}")))
    }

    fn ref_to_id(&self, type_name: &str, reference: &str) -> PlanResult<Value> {
        let (target_type, raw_id) = reference
            .split_once('#')
            .ok_or_else(|| PlanError::InvalidReference(reference.to_string()))?;
        if target_type != type_name {
            return Err(PlanError::InvalidReference(format!(
                "reference {reference} does not target {type_name}"
            )));
        }
        let desc = self.get_record_type_desc(target_type)?;
        let id_desc = desc.id_descriptor()?;
        match id_desc.value_type {
            ValueType::Number => raw_id
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| PlanError::InvalidReference(reference.to_string())),
            ValueType::String => Ok(Value::String(raw_id.to_string())),
            _ => Err(PlanError::InvalidReference(format!(
                "id property of {target_type} has unsupported type for reference coercion"
            ))),
        }
    }
}
