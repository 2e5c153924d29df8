// src/schema/mod.rs

//! Schema/data-library seam.
//!
//! The engine only sees the `SchemaProvider` trait: module lookup, data
//! validation, implicit defaults, schema-aware path construction, and
//! extraction of inter-module data dependencies. `BasicSchema` is the
//! reference provider, driven by programmatic module definitions; an adapter
//! over a full YANG stack plugs in behind the same trait.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{Error, Result};
use crate::tree::edit::EditOp;
use crate::tree::{xpath, DataNode, Forest, NodeKind};

/// Kind of a schema node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaKind {
    Container {
        presence: bool,
    },
    Leaf {
        mandatory: bool,
        default: Option<String>,
        /// Absolute path the leaf references (leafref).
        leafref: Option<String>,
        /// Leaf holds an instance-identifier, resolved only against data.
        instance_id: bool,
    },
    LeafList,
    List {
        keys: Vec<String>,
    },
    Rpc,
    Notification,
}

/// One node of a module's schema tree.
#[derive(Debug, Clone)]
pub struct SchemaNode {
    pub name: String,
    pub kind: SchemaKind,
    pub config: bool,
    pub children: Vec<SchemaNode>,
}

impl SchemaNode {
    pub fn container(name: &str) -> Self {
        Self {
            name: name.into(),
            kind: SchemaKind::Container { presence: false },
            config: true,
            children: Vec::new(),
        }
    }

    pub fn leaf(name: &str) -> Self {
        Self {
            name: name.into(),
            kind: SchemaKind::Leaf {
                mandatory: false,
                default: None,
                leafref: None,
                instance_id: false,
            },
            config: true,
            children: Vec::new(),
        }
    }

    pub fn list(name: &str, keys: &[&str]) -> Self {
        Self {
            name: name.into(),
            kind: SchemaKind::List {
                keys: keys.iter().map(|k| k.to_string()).collect(),
            },
            config: true,
            children: Vec::new(),
        }
    }

    pub fn state(mut self) -> Self {
        self.config = false;
        self
    }

    pub fn mandatory(mut self) -> Self {
        if let SchemaKind::Leaf { mandatory, .. } = &mut self.kind {
            *mandatory = true;
        }
        self
    }

    pub fn with_default(mut self, value: &str) -> Self {
        if let SchemaKind::Leaf { default, .. } = &mut self.kind {
            *default = Some(value.to_string());
        }
        self
    }

    pub fn leafref(mut self, target: &str) -> Self {
        if let SchemaKind::Leaf { leafref, .. } = &mut self.kind {
            *leafref = Some(target.to_string());
        }
        self
    }

    pub fn instance_id(mut self) -> Self {
        if let SchemaKind::Leaf { instance_id, .. } = &mut self.kind {
            *instance_id = true;
        }
        self
    }

    pub fn with_child(mut self, child: SchemaNode) -> Self {
        self.children.push(child);
        self
    }

    fn find(&self, name: &str) -> Option<&SchemaNode> {
        self.children.iter().find(|c| c.name == name)
    }

    fn data_kind(&self) -> NodeKind {
        match &self.kind {
            SchemaKind::Container { presence } => NodeKind::Container { presence: *presence },
            SchemaKind::Leaf { .. } => NodeKind::Leaf,
            SchemaKind::LeafList => NodeKind::LeafList,
            SchemaKind::List { keys } => NodeKind::List { keys: keys.clone() },
            // Operations instantiate as containers in data.
            SchemaKind::Rpc | SchemaKind::Notification => NodeKind::Container { presence: true },
        }
    }
}

/// Definition of one module.
#[derive(Debug, Clone)]
pub struct ModuleSchema {
    pub name: String,
    pub revision: Option<String>,
    pub features: Vec<String>,
    pub replay_support: bool,
    pub nodes: Vec<SchemaNode>,
}

impl ModuleSchema {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            revision: None,
            features: Vec::new(),
            replay_support: false,
            nodes: Vec::new(),
        }
    }

    pub fn with_revision(mut self, revision: &str) -> Self {
        self.revision = Some(revision.to_string());
        self
    }

    pub fn with_feature(mut self, feature: &str) -> Self {
        self.features.push(feature.to_string());
        self
    }

    pub fn with_replay(mut self) -> Self {
        self.replay_support = true;
        self
    }

    pub fn with_node(mut self, node: SchemaNode) -> Self {
        self.nodes.push(node);
        self
    }

    fn find_top(&self, name: &str) -> Option<&SchemaNode> {
        self.nodes.iter().find(|n| n.name == name)
    }
}

/// Dependency kind extracted from a schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepKind {
    /// Module reference (leafref, when, must).
    Ref,
    /// Instance-identifier, resolvable only against data.
    InstId,
}

/// One inter-module data dependency.
#[derive(Debug, Clone)]
pub struct DepEntry {
    pub kind: DepKind,
    /// Referenced module; unknown until data resolution for `InstId`.
    pub module: Option<String>,
    /// Location of the dependency within the owning module.
    pub xpath: String,
}

/// External seam to the schema/data library.
pub trait SchemaProvider: Send + Sync {
    fn module(&self, name: &str) -> Option<Arc<ModuleSchema>>;

    fn modules(&self) -> Vec<Arc<ModuleSchema>>;

    /// Validate one module's subtrees within the full forest (leafref targets
    /// may cross modules). Fails with `ValidationFailed` carrying the node
    /// path.
    fn validate_module(&self, module: &str, full_data: &[DataNode]) -> Result<()>;

    /// Materialize implicit defaults and missing non-presence containers for
    /// one module. Idempotent.
    fn add_defaults(&self, module: &str, data: &mut Forest) -> Result<()>;

    /// Recreate missing non-presence containers only, leaving default leaves
    /// alone (the operational view wants structure, not implied config).
    fn add_np_containers(&self, module: &str, data: &mut Forest) -> Result<()>;

    /// Build the data path `xpath` inside `forest` with schema-correct node
    /// kinds, setting `value` and `op` on the final node.
    fn new_path(
        &self,
        forest: &mut Forest,
        xpath: &str,
        value: Option<&str>,
        op: Option<EditOp>,
    ) -> Result<()>;

    /// Inter-module data dependencies declared by a module's schema.
    fn data_deps(&self, module: &str) -> Vec<DepEntry>;

    /// Modules referenced by instance-identifier values present in `data`.
    fn instid_dep_modules(&self, module: &str, data: &[DataNode]) -> Vec<String>;

    /// Schema node of an RPC/action/notification, with its parent path.
    fn op_schema(&self, op_path: &str) -> Result<(String, SchemaKind)>;
}

/// Reference provider over programmatic module definitions.
#[derive(Default)]
pub struct BasicSchema {
    modules: RwLock<HashMap<String, Arc<ModuleSchema>>>,
}

impl BasicSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, schema: ModuleSchema) {
        self.modules
            .write()
            .expect("schema registry poisoned")
            .insert(schema.name.clone(), Arc::new(schema));
    }

    fn schema_node_for<'a>(
        schema: &'a ModuleSchema,
        steps: &[xpath::Step<'_>],
    ) -> Option<&'a SchemaNode> {
        let mut node = schema.find_top(steps.first()?.name)?;
        for step in &steps[1..] {
            node = node.find(step.name)?;
        }
        Some(node)
    }

    fn validate_node(
        &self,
        schema: &SchemaNode,
        node: &DataNode,
        full_data: &[DataNode],
        path: &str,
    ) -> Result<()> {
        let path = format!("{}/{}", path, node.path_segment());

        match &schema.kind {
            SchemaKind::List { keys } => {
                for key in keys {
                    if !node
                        .children
                        .iter()
                        .any(|c| &c.name == key && c.value.is_some())
                    {
                        return Err(Error::validation(format!("missing list key '{key}'"), path));
                    }
                }
            }
            SchemaKind::Leaf {
                leafref: Some(target),
                ..
            } => {
                if let Some(value) = &node.value {
                    let matches = xpath::eval(full_data, target)?;
                    if !matches.iter().any(|m| m.value.as_deref() == Some(value)) {
                        return Err(Error::validation(
                            format!("leafref target '{target}' has no instance '{value}'"),
                            path,
                        ));
                    }
                }
            }
            SchemaKind::Leaf { instance_id: true, .. } => {
                if let Some(value) = &node.value {
                    if xpath::eval(full_data, value)?.is_empty() {
                        return Err(Error::validation(
                            format!("instance-identifier '{value}' does not exist"),
                            path,
                        ));
                    }
                }
            }
            _ => {}
        }

        // Mandatory leaves under this present node.
        for child_schema in &schema.children {
            if let SchemaKind::Leaf { mandatory: true, .. } = child_schema.kind {
                if !node.children.iter().any(|c| c.name == child_schema.name) {
                    return Err(Error::validation(
                        format!("mandatory leaf '{}' missing", child_schema.name),
                        path,
                    ));
                }
            }
        }

        for child in &node.children {
            if let Some(child_schema) = schema.find(&child.name) {
                self.validate_node(child_schema, child, full_data, &path)?;
            } else {
                return Err(Error::validation(
                    format!("unknown node '{}'", child.name),
                    format!("{}/{}", path, child.name),
                ));
            }
        }
        Ok(())
    }

    fn defaults_under(schema: &SchemaNode, node: &mut DataNode, module: &str) {
        for child_schema in &schema.children {
            match &child_schema.kind {
                SchemaKind::Leaf {
                    default: Some(value),
                    ..
                } => {
                    if !node.children.iter().any(|c| c.name == child_schema.name) {
                        let mut leaf = DataNode::leaf(module, &child_schema.name, value);
                        leaf.dflt = true;
                        leaf.config = child_schema.config;
                        node.children.push(leaf);
                    }
                }
                SchemaKind::Container { presence: false } => {
                    if !node.children.iter().any(|c| c.name == child_schema.name) {
                        let mut cont = DataNode::container(module, &child_schema.name);
                        cont.config = child_schema.config;
                        node.children.push(cont);
                    }
                }
                _ => {}
            }
        }
        for child in &mut node.children {
            if let Some(child_schema) = schema.find(&child.name) {
                Self::defaults_under(child_schema, child, module);
            }
        }
        // NP containers created above that gained no content stay: they are
        // re-trimmed on print, and validation tolerates them.
    }

    fn np_under(schema: &SchemaNode, node: &mut DataNode, module: &str) {
        for child_schema in &schema.children {
            if let SchemaKind::Container { presence: false } = child_schema.kind {
                if !node.children.iter().any(|c| c.name == child_schema.name) {
                    let mut cont = DataNode::container(module, &child_schema.name);
                    cont.config = child_schema.config;
                    node.children.push(cont);
                }
            }
        }
        for child in &mut node.children {
            if let Some(child_schema) = schema.find(&child.name) {
                Self::np_under(child_schema, child, module);
            }
        }
    }

    fn find_op<'a>(schema: &'a ModuleSchema, steps: &[xpath::Step<'_>]) -> Option<&'a SchemaNode> {
        Self::schema_node_for(schema, steps)
    }
}

impl SchemaProvider for BasicSchema {
    fn module(&self, name: &str) -> Option<Arc<ModuleSchema>> {
        self.modules
            .read()
            .expect("schema registry poisoned")
            .get(name)
            .cloned()
    }

    fn modules(&self) -> Vec<Arc<ModuleSchema>> {
        let mut all: Vec<_> = self
            .modules
            .read()
            .expect("schema registry poisoned")
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    fn validate_module(&self, module: &str, full_data: &[DataNode]) -> Result<()> {
        let schema = self
            .module(module)
            .ok_or_else(|| Error::not_found(format!("module '{module}' not installed")))?;
        for root in full_data.iter().filter(|n| n.module == module) {
            let root_schema = schema
                .find_top(&root.name)
                .ok_or_else(|| Error::validation(format!("unknown node '{}'", root.name), format!("/{module}:{}", root.name)))?;
            self.validate_node(root_schema, root, full_data, "")?;
        }
        Ok(())
    }

    fn add_defaults(&self, module: &str, data: &mut Forest) -> Result<()> {
        let schema = self
            .module(module)
            .ok_or_else(|| Error::not_found(format!("module '{module}' not installed")))?;

        // Top-level NP containers and defaults exist even with no data.
        for top in &schema.nodes {
            match &top.kind {
                SchemaKind::Container { presence: false } => {
                    if !data.iter().any(|n| n.module == module && n.name == top.name) {
                        let mut cont = DataNode::container(module, &top.name);
                        cont.config = top.config;
                        data.push(cont);
                    }
                }
                SchemaKind::Leaf {
                    default: Some(value),
                    ..
                } => {
                    if !data.iter().any(|n| n.module == module && n.name == top.name) {
                        let mut leaf = DataNode::leaf(module, &top.name, value);
                        leaf.dflt = true;
                        leaf.config = top.config;
                        data.push(leaf);
                    }
                }
                _ => {}
            }
        }
        for root in data.iter_mut().filter(|n| n.module == module) {
            if let Some(root_schema) = schema.find_top(&root.name) {
                Self::defaults_under(root_schema, root, module);
            }
        }
        Ok(())
    }

    fn add_np_containers(&self, module: &str, data: &mut Forest) -> Result<()> {
        let schema = self
            .module(module)
            .ok_or_else(|| Error::not_found(format!("module '{module}' not installed")))?;
        for top in &schema.nodes {
            if let SchemaKind::Container { presence: false } = top.kind {
                if !data.iter().any(|n| n.module == module && n.name == top.name) {
                    let mut cont = DataNode::container(module, &top.name);
                    cont.config = top.config;
                    data.push(cont);
                }
            }
        }
        for root in data.iter_mut().filter(|n| n.module == module) {
            if let Some(root_schema) = schema.find_top(&root.name) {
                Self::np_under(root_schema, root, module);
            }
        }
        Ok(())
    }

    fn new_path(
        &self,
        forest: &mut Forest,
        path: &str,
        value: Option<&str>,
        op: Option<EditOp>,
    ) -> Result<()> {
        let all = xpath::steps(path)?;
        let module_name = all[0]
            .module
            .ok_or_else(|| Error::inval_arg(format!("path '{path}' lacks a module qualifier")))?
            .to_string();
        let schema = self
            .module(&module_name)
            .ok_or_else(|| Error::not_found(format!("module '{module_name}' not installed")))?;

        let mut siblings: &mut Vec<DataNode> = forest;
        let mut schema_cursor: Option<&SchemaNode> = None;

        for (i, step) in all.iter().enumerate() {
            let schema_node = match schema_cursor {
                None => schema.find_top(step.name),
                Some(parent) => parent.find(step.name),
            }
            .ok_or_else(|| {
                Error::validation(format!("unknown schema node '{}'", step.name), path)
            })?;

            let last = i + 1 == all.len();
            let mut probe = DataNode::new(&module_name, step.name, schema_node.data_kind(), None);
            probe.config = schema_node.config;
            for pred in &step.predicates {
                if let Some((key, kval)) = xpath::key_equality(pred) {
                    if key == "." {
                        probe.value = Some(kval.to_string());
                    } else {
                        let mut kleaf = DataNode::leaf(&module_name, key, kval);
                        kleaf.config = schema_node.config;
                        probe.children.push(kleaf);
                    }
                }
            }
            if last {
                if let Some(v) = value {
                    if probe.is_leaf() {
                        probe.value = Some(v.to_string());
                    }
                }
                probe.edit_op = op;
            }

            let level = siblings;
            let pos = match level.iter().position(|c| c.same_instance(&probe)) {
                Some(pos) => {
                    if last {
                        if let Some(v) = value {
                            level[pos].value = Some(v.to_string());
                        }
                        level[pos].edit_op = op;
                    }
                    pos
                }
                None => {
                    level.push(probe);
                    level.len() - 1
                }
            };
            siblings = &mut level[pos].children;
            schema_cursor = Some(schema_node);
        }
        Ok(())
    }

    fn data_deps(&self, module: &str) -> Vec<DepEntry> {
        let Some(schema) = self.module(module) else {
            return Vec::new();
        };
        let mut deps = Vec::new();
        let mut stack: Vec<(&SchemaNode, String)> = schema
            .nodes
            .iter()
            .map(|n| (n, format!("/{module}:{}", n.name)))
            .collect();
        while let Some((node, path)) = stack.pop() {
            if let SchemaKind::Leaf {
                leafref,
                instance_id,
                ..
            } = &node.kind
            {
                if let Some(target) = leafref {
                    if let Ok(steps) = xpath::steps(target) {
                        if let Some(target_mod) = steps[0].module {
                            if target_mod != module {
                                deps.push(DepEntry {
                                    kind: DepKind::Ref,
                                    module: Some(target_mod.to_string()),
                                    xpath: path.clone(),
                                });
                            }
                        }
                    }
                }
                if *instance_id {
                    deps.push(DepEntry {
                        kind: DepKind::InstId,
                        module: None,
                        xpath: path.clone(),
                    });
                }
            }
            for child in &node.children {
                stack.push((child, format!("{}/{}", path, child.name)));
            }
        }
        deps
    }

    fn instid_dep_modules(&self, module: &str, data: &[DataNode]) -> Vec<String> {
        let mut out = Vec::new();
        for dep in self.data_deps(module) {
            if dep.kind != DepKind::InstId {
                continue;
            }
            if let Ok(nodes) = xpath::eval(data, &dep.xpath) {
                for node in nodes {
                    if let Some(value) = &node.value {
                        if let Ok(steps) = xpath::steps(value) {
                            if let Some(m) = steps[0].module {
                                if m != module && !out.contains(&m.to_string()) {
                                    out.push(m.to_string());
                                }
                            }
                        }
                    }
                }
            }
        }
        out
    }

    fn op_schema(&self, op_path: &str) -> Result<(String, SchemaKind)> {
        let all = xpath::steps(op_path)?;
        let module_name = all[0]
            .module
            .ok_or_else(|| Error::inval_arg(format!("path '{op_path}' lacks a module qualifier")))?;
        let schema = self
            .module(module_name)
            .ok_or_else(|| Error::not_found(format!("module '{module_name}' not installed")))?;
        let node = Self::find_op(&schema, &all)
            .ok_or_else(|| Error::not_found(format!("operation '{op_path}' not in schema")))?;
        match node.kind {
            SchemaKind::Rpc | SchemaKind::Notification => {
                let parent = xpath::trim_last_node(op_path)?.unwrap_or_default();
                Ok((parent, node.kind.clone()))
            }
            _ => Err(Error::inval_arg(format!("'{op_path}' is not an operation"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iface_schema() -> ModuleSchema {
        ModuleSchema::new("if").with_revision("2020-01-01").with_node(
            SchemaNode::container("interfaces").with_child(
                SchemaNode::list("interface", &["name"])
                    .with_child(SchemaNode::leaf("name"))
                    .with_child(SchemaNode::leaf("mtu").with_default("1500"))
                    .with_child(SchemaNode::leaf("oper-state").state()),
            ),
        )
    }

    #[test]
    fn test_new_path_builds_list_chain() {
        let schema = BasicSchema::new();
        schema.register(iface_schema());
        let mut forest = Vec::new();
        schema
            .new_path(
                &mut forest,
                "/if:interfaces/if:interface[name='eth0']/if:mtu",
                Some("9000"),
                None,
            )
            .unwrap();
        let hits = xpath::eval(&forest, "/if:interfaces/if:interface[name='eth0']/if:mtu").unwrap();
        assert_eq!(hits[0].value.as_deref(), Some("9000"));
    }

    #[test]
    fn test_defaults_idempotent() {
        let schema = BasicSchema::new();
        schema.register(iface_schema());
        let mut forest = Vec::new();
        schema
            .new_path(&mut forest, "/if:interfaces/if:interface[name='eth0']", None, None)
            .unwrap();
        schema.add_defaults("if", &mut forest).unwrap();
        let once = forest.clone();
        schema.add_defaults("if", &mut forest).unwrap();
        assert_eq!(once, forest);
        let hits = xpath::eval(&forest, "/if:interfaces/if:interface[name='eth0']/if:mtu").unwrap();
        assert_eq!(hits[0].value.as_deref(), Some("1500"));
        assert!(hits[0].dflt);
    }

    #[test]
    fn test_validate_missing_key() {
        let schema = BasicSchema::new();
        schema.register(iface_schema());
        let bad = vec![DataNode::container("if", "interfaces").with_child(DataNode::new(
            "if",
            "interface",
            NodeKind::List {
                keys: vec!["name".into()],
            },
            None,
        ))];
        let err = schema.validate_module("if", &bad).unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::ValidationFailed);
    }

    #[test]
    fn test_leafref_cross_module() {
        let schema = BasicSchema::new();
        schema.register(
            ModuleSchema::new("a").with_node(
                SchemaNode::container("root").with_child(SchemaNode::leaf("name")),
            ),
        );
        schema.register(
            ModuleSchema::new("b").with_node(
                SchemaNode::container("root")
                    .with_child(SchemaNode::leaf("target").leafref("/a:root/a:name")),
            ),
        );

        let deps = schema.data_deps("b");
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].module.as_deref(), Some("a"));
        assert_eq!(deps[0].kind, DepKind::Ref);

        let mut data = vec![
            DataNode::container("a", "root").with_child(DataNode::leaf("a", "name", "x")),
            DataNode::container("b", "root").with_child(DataNode::leaf("b", "target", "x")),
        ];
        schema.validate_module("b", &data).unwrap();

        // Break the reference.
        data[0].children.clear();
        let err = schema.validate_module("b", &data).unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::ValidationFailed);
    }
}
