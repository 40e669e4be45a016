//! Properties-tree builder (spec §4.2, component C2).
//!
//! Expands inclusion patterns into a typed tree of selected properties.
//! Nodes live in an arena indexed by `usize` rather than a graph of `Rc`s —
//! the ancestor link only needs to go one way for any given walk, and the
//! arena makes `combine` a matter of merging two flat index spaces instead
//! of threading shared mutable parents.

use std::sync::Arc;

use crate::error::{PlanError, PlanResult};
use crate::schema::{
    Clause, PropertyDescriptor, RecordContainer, RecordTypeLibrary, StructuralKind, UsageFlags,
    ValueType,
};

/// One node of a [`PropertiesTree`].
#[derive(Debug, Clone)]
pub struct PropNode {
    /// Dot-separated path from the tree root; empty for the root itself.
    pub path: String,
    /// This node's own name within its parent container, or the subtype
    /// name when `is_subtype_selector` is set.
    pub name: String,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
    /// `None` only for the root node (the top collection itself).
    pub descriptor: Option<Arc<PropertyDescriptor>>,
    pub usage: UsageFlags,
    /// Whether this node exists to pick a polymorphic subtype rather than
    /// name a property (its `descriptor` is then the *parent's*).
    pub is_subtype_selector: bool,
    /// Whether this node was reached through the synthetic super-type
    /// rather than the record type's own container.
    pub is_super: bool,
}

impl PropNode {
    fn root() -> Self {
        Self {
            path: String::new(),
            name: String::new(),
            parent: None,
            children: Vec::new(),
            descriptor: None,
            usage: UsageFlags::empty(),
            is_subtype_selector: false,
            is_super: false,
        }
    }
}

/// A properties tree: a typed selection of properties for one clause of one
/// operation, rooted at a record type's top collection.
#[derive(Debug, Clone)]
pub struct PropertiesTree {
    pub root_type: String,
    arena: Vec<PropNode>,
}

impl PropertiesTree {
    pub const ROOT: usize = 0;

    pub fn node(&self, idx: usize) -> &PropNode {
        &self.arena[idx]
    }

    pub fn children(&self, idx: usize) -> &[usize] {
        &self.arena[idx].children
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.len() <= 1
    }

    /// Finds a node by its dot-separated path relative to the tree root.
    pub fn find_path(&self, path: &str) -> Option<usize> {
        self.arena.iter().position(|n| n.path == path)
    }

    fn child_named(&self, parent: usize, name: &str) -> Option<usize> {
        self.arena[parent]
            .children
            .iter()
            .copied()
            .find(|&c| self.arena[c].name == name)
    }
}

struct Builder<'a> {
    arena: Vec<PropNode>,
    clause: Clause,
    usage: UsageFlags,
    library: &'a dyn RecordTypeLibrary,
}

impl<'a> Builder<'a> {
    fn get_or_create_child(
        &mut self,
        parent: usize,
        name: &str,
        descriptor: Option<Arc<PropertyDescriptor>>,
        is_subtype_selector: bool,
        is_super: bool,
    ) -> usize {
        if let Some(existing) = self.arena[parent]
            .children
            .iter()
            .copied()
            .find(|&c| self.arena[c].name == name)
        {
            self.arena[existing].usage |= self.usage;
            return existing;
        }

        let path = if self.arena[parent].path.is_empty() {
            name.to_string()
        } else {
            format!("{}.{name}", self.arena[parent].path)
        };
        let idx = self.arena.len();
        self.arena.push(PropNode {
            path,
            name: name.to_string(),
            parent: Some(parent),
            children: Vec::new(),
            descriptor,
            usage: self.usage,
            is_subtype_selector,
            is_super,
        });
        self.arena[parent].children.push(idx);
        idx
    }

    fn expand(
        &mut self,
        base: usize,
        container: &RecordContainer,
        segments: &[&str],
        is_super: bool,
    ) -> PlanResult<()> {
        let Some((&seg, tail)) = segments.split_first() else {
            return Ok(());
        };

        if seg == "*" {
            if self.clause != Clause::Select {
                return Err(PlanError::usage(
                    "wildcard inclusion is only valid for a select clause",
                ));
            }
            if !tail.is_empty() {
                return Err(PlanError::usage("wildcard must terminate a pattern"));
            }
            for prop in &container.properties {
                if !prop.fetchable_by_default() {
                    continue;
                }
                let prop_arc = Arc::new(prop.clone());
                let child = self.get_or_create_child(base, &prop.name, Some(prop_arc), false, is_super);
                if let (ValueType::Object, Some(nested)) = (&prop.value_type, &prop.nested) {
                    self.expand(child, nested, &["*"], is_super)?;
                }
            }
            return Ok(());
        }

        let prop = container
            .get(seg)
            .ok_or_else(|| PlanError::usage(format!("unknown property `{seg}`")))?;

        if !tail.is_empty()
            && matches!(self.clause, Clause::Where | Clause::Order)
            && prop.structural_kind != StructuralKind::Scalar
        {
            return Err(PlanError::usage(format!(
                "`{seg}` is not scalar; a where/order path cannot traverse a collection, use a collection test instead"
            )));
        }

        let prop_arc = Arc::new(prop.clone());
        let child = self.get_or_create_child(base, seg, Some(prop_arc.clone()), false, is_super);

        if prop_arc.is_polymorphic() {
            return self.expand_polymorphic(child, &prop_arc, tail, is_super);
        }

        match (&prop.value_type, &prop.nested) {
            (ValueType::Object, Some(nested)) if !tail.is_empty() => {
                self.expand(child, nested, tail, is_super)
            }
            _ if tail.is_empty() => Ok(()),
            _ => Err(PlanError::usage(format!(
                "`{seg}` has no nested properties to continue path into"
            ))),
        }
    }

    fn expand_polymorphic(
        &mut self,
        node: usize,
        prop: &Arc<PropertyDescriptor>,
        tail: &[&str],
        is_super: bool,
    ) -> PlanResult<()> {
        match tail.split_first() {
            Some((&subtype_name, rest)) => {
                let subtype = prop.subtypes.iter().find(|s| s.name == subtype_name).ok_or_else(|| {
                    PlanError::usage(format!("unknown subtype `{subtype_name}` for polymorphic property"))
                })?;
                let selector = self.get_or_create_child(
                    node,
                    subtype_name,
                    Some(prop.clone()),
                    true,
                    is_super,
                );
                self.expand(selector, &subtype.container, rest, is_super)
            }
            None => {
                if self.clause != Clause::Select {
                    return Err(PlanError::usage(
                        "a polymorphic path used outside select must name a subtype",
                    ));
                }
                for subtype in &prop.subtypes {
                    let selector = self.get_or_create_child(
                        node,
                        &subtype.name,
                        Some(prop.clone()),
                        true,
                        is_super,
                    );
                    self.expand(selector, &subtype.container, &["*"], is_super)?;
                }
                Ok(())
            }
        }
    }

    fn remove_path(&mut self, base: usize, segments: &[&str]) {
        let Some((&seg, tail)) = segments.split_first() else {
            return;
        };
        let Some(child) = self.arena[base]
            .children
            .iter()
            .copied()
            .find(|&c| self.arena[c].name == seg)
        else {
            return;
        };
        if tail.is_empty() {
            self.arena[base].children.retain(|&c| c != child);
        } else {
            self.remove_path(child, tail);
        }
    }
}

/// Builds a properties tree for one clause from a batch of inclusion /
/// exclusion patterns (spec §4.2).
pub fn build(
    library: &dyn RecordTypeLibrary,
    root_type_name: &str,
    clause: Clause,
    patterns: &[&str],
) -> PlanResult<PropertiesTree> {
    let root_desc = library.get_record_type_desc(root_type_name)?;

    let mut inclusions = Vec::new();
    let mut exclusions = Vec::new();
    for &p in patterns {
        match p.strip_prefix('-') {
            Some(rest) => exclusions.push(rest),
            None => inclusions.push(p),
        }
    }

    let mut builder = Builder {
        arena: vec![PropNode::root()],
        clause,
        usage: clause.usage_flag(),
        library,
    };

    for pat in inclusions {
        if let Some(rest) = pat.strip_prefix('.') {
            let super_container = root_desc.super_container.as_ref().ok_or_else(|| {
                PlanError::usage(format!("record type `{root_type_name}` has no super-properties"))
            })?;
            let segments: Vec<&str> = rest.split('.').collect();
            builder.expand(PropertiesTree::ROOT, super_container, &segments, true)?;
        } else {
            let segments: Vec<&str> = pat.split('.').collect();
            builder.expand(PropertiesTree::ROOT, &root_desc.container, &segments, false)?;
        }
    }

    for pat in exclusions {
        let segments: Vec<&str> = pat.split('.').collect();
        builder.remove_path(PropertiesTree::ROOT, &segments);
    }

    Ok(PropertiesTree {
        root_type: root_type_name.to_string(),
        arena: builder.arena,
    })
}

/// Unions two trees for the same root record type: node set is the union,
/// usage flags are bitwise-or'd, children recursively combined.
pub fn combine(a: &PropertiesTree, b: &PropertiesTree) -> PlanResult<PropertiesTree> {
    if a.root_type != b.root_type {
        return Err(PlanError::usage(format!(
            "cannot combine properties trees for different record types `{}` and `{}`",
            a.root_type, b.root_type
        )));
    }

    let mut merged = PropertiesTree {
        root_type: a.root_type.clone(),
        arena: vec![PropNode::root()],
    };
    merged.arena[0].usage = a.arena[0].usage | b.arena[0].usage;

    merge_children(&mut merged, PropertiesTree::ROOT, a, PropertiesTree::ROOT);
    merge_children(&mut merged, PropertiesTree::ROOT, b, PropertiesTree::ROOT);

    Ok(merged)
}

fn merge_children(dest: &mut PropertiesTree, dest_idx: usize, src: &PropertiesTree, src_idx: usize) {
    for &src_child in src.children(src_idx) {
        let src_node = src.node(src_child);
        let dest_child = match dest.child_named(dest_idx, &src_node.name) {
            Some(existing) => {
                dest.arena[existing].usage |= src_node.usage;
                existing
            }
            None => {
                let path = if dest.arena[dest_idx].path.is_empty() {
                    src_node.name.clone()
                } else {
                    format!("{}.{}", dest.arena[dest_idx].path, src_node.name)
                };
                let idx = dest.arena.len();
                dest.arena.push(PropNode {
                    path,
                    name: src_node.name.clone(),
                    parent: Some(dest_idx),
                    children: Vec::new(),
                    descriptor: src_node.descriptor.clone(),
                    usage: src_node.usage,
                    is_subtype_selector: src_node.is_subtype_selector,
                    is_super: src_node.is_super,
                });
                dest.arena[dest_idx].children.push(idx);
                idx
            }
        };
        merge_children(dest, dest_child, src, src_child);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{
        ChildTableLayout, Generator, MetaInfoMapping, PropertyFlags, RecordTypeDescriptor,
        StaticLibrary, StorageShape,
    };

    fn scalar(name: &str, value_type: ValueType, flags: PropertyFlags) -> PropertyDescriptor {
        PropertyDescriptor {
            name: name.to_string(),
            structural_kind: StructuralKind::Scalar,
            value_type,
            storage_shape: StorageShape::InlineColumn,
            generator: Generator::None,
            flags,
            child_table: None,
            column: Some(name.to_string()),
            nested: None,
            subtypes: Vec::new(),
        }
    }

    fn order_lines_library() -> StaticLibrary {
        let mut lib = StaticLibrary::new();
        let line_container = Arc::new(RecordContainer {
            properties: vec![
                scalar("sku", ValueType::String, PropertyFlags::empty()),
                scalar("qty", ValueType::Number, PropertyFlags::empty()),
            ],
        });
        let lines_prop = PropertyDescriptor {
            name: "lines".to_string(),
            structural_kind: StructuralKind::Array,
            value_type: ValueType::Object,
            storage_shape: StorageShape::ChildTable,
            generator: Generator::None,
            flags: PropertyFlags::empty(),
            child_table: Some(ChildTableLayout {
                table: "order_lines".to_string(),
                parent_id_column: "order_id".to_string(),
                index_column: Some("idx".to_string()),
                key_column: None,
                key_value_type: None,
            }),
            column: None,
            nested: Some(line_container),
            subtypes: Vec::new(),
        };
        let id_prop = scalar("id", ValueType::Number, PropertyFlags::ID);
        lib.register(RecordTypeDescriptor {
            name: "Order".to_string(),
            main_table: "orders".to_string(),
            id_property: "id".to_string(),
            container: Arc::new(RecordContainer {
                properties: vec![id_prop, lines_prop],
            }),
            meta_info: Some(MetaInfoMapping::default()),
            subtypes: Vec::new(),
            discriminator_property: None,
            super_container: None,
        });
        lib
    }

    #[test]
    fn wildcard_expands_fetchable_properties() {
        let lib = order_lines_library();
        let tree = build(&lib, "Order", Clause::Select, &["*"]).unwrap();
        assert!(tree.find_path("id").is_some());
        assert!(tree.find_path("lines").is_some());
    }

    #[test]
    fn nested_path_reaches_child_table_property() {
        let lib = order_lines_library();
        let tree = build(&lib, "Order", Clause::Select, &["lines.sku"]).unwrap();
        let idx = tree.find_path("lines.sku").expect("lines.sku present");
        assert_eq!(tree.node(idx).name, "sku");
    }

    #[test]
    fn exclusion_removes_wildcard_expanded_node() {
        let lib = order_lines_library();
        let tree = build(&lib, "Order", Clause::Select, &["*", "-lines"]).unwrap();
        assert!(tree.find_path("lines").is_none());
        assert!(tree.find_path("id").is_some());
    }

    #[test]
    fn where_clause_rejects_collection_intermediate() {
        let lib = order_lines_library();
        let err = build(&lib, "Order", Clause::Where, &["lines.sku"]).unwrap_err();
        assert!(err.is_usage());
    }

    #[test]
    fn wildcard_rejected_outside_select() {
        let lib = order_lines_library();
        let err = build(&lib, "Order", Clause::Where, &["*"]).unwrap_err();
        assert!(err.is_usage());
    }

    #[test]
    fn combine_unions_two_trees() {
        let lib = order_lines_library();
        let a = build(&lib, "Order", Clause::Select, &["id"]).unwrap();
        let b = build(&lib, "Order", Clause::Select, &["lines.sku"]).unwrap();
        let merged = combine(&a, &b).unwrap();
        assert!(merged.find_path("id").is_some());
        assert!(merged.find_path("lines.sku").is_some());
    }
}
