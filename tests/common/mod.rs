// tests/common/mod.rs

//! Shared fixtures: a TempDir-backed repository with its own SHM directory
//! and a few module schemas the scenarios reuse.

#![allow(dead_code)]

use std::sync::Arc;

use tempfile::TempDir;
use yangstore::{
    BasicSchema, ConnOptions, Connection, Datastore, Layout, ModuleSchema, SchemaNode, Session,
};

pub struct Fixture {
    pub dir: TempDir,
    pub schema: Arc<BasicSchema>,
}

impl Fixture {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("tempdir"),
            schema: Arc::new(BasicSchema::new()),
        }
    }

    pub fn layout(&self) -> Layout {
        Layout::with_shm_dir(self.dir.path().join("repo"), self.dir.path().join("shm"))
            .expect("layout")
    }

    pub fn connect(&self) -> Arc<Connection> {
        Connection::connect(
            self.layout(),
            self.schema.clone(),
            ConnOptions { cache_running: true },
        )
        .expect("connect")
    }

    pub fn connect_plain(&self) -> Arc<Connection> {
        Connection::connect(self.layout(), self.schema.clone(), ConnOptions::default())
            .expect("connect")
    }

    pub fn session(&self, conn: &Arc<Connection>) -> Session {
        Session::start(conn.clone(), "tester")
    }
}

/// `m1` with `/m1:root/a`.
pub fn m1_schema() -> ModuleSchema {
    ModuleSchema::new("m1")
        .with_revision("2020-01-01")
        .with_node(SchemaNode::container("root").with_child(SchemaNode::leaf("a")))
}

/// `if` interfaces module with a state leaf.
pub fn if_schema() -> ModuleSchema {
    ModuleSchema::new("if").with_revision("2021-06-30").with_node(
        SchemaNode::container("interfaces").with_child(
            SchemaNode::list("interface", &["name"])
                .with_child(SchemaNode::leaf("name"))
                .with_child(SchemaNode::leaf("mtu").with_default("1500"))
                .with_child(SchemaNode::leaf("oper-state").state()),
        ),
    )
}

/// `ops` depending on `ops-ref` through a leafref.
pub fn ops_schemas() -> (ModuleSchema, ModuleSchema) {
    let ops_ref = ModuleSchema::new("ops-ref")
        .with_node(SchemaNode::container("root").with_child(SchemaNode::leaf("name")));
    let ops = ModuleSchema::new("ops").with_node(
        SchemaNode::container("root")
            .with_child(SchemaNode::leaf("target").leafref("/ops-ref:root/ops-ref:name")),
    );
    (ops, ops_ref)
}

/// The notifications module carrying config-change notifications.
pub fn notif_schema() -> ModuleSchema {
    ModuleSchema::new("ietf-netconf-notifications")
        .with_replay()
        .with_node(SchemaNode {
            name: "netconf-config-change".into(),
            kind: yangstore::schema::SchemaKind::Notification,
            config: true,
            children: Vec::new(),
        })
}

/// Read the current version of a module.
pub fn module_ver(conn: &Arc<Connection>, name: &str) -> u32 {
    conn.modules()
        .into_iter()
        .find(|m| m.name == name)
        .map(|m| m.ver)
        .expect("module installed")
}

/// Datastore file contents, for unchanged-file assertions.
pub fn raw_file(layout: &Layout, module: &str, ds: Datastore) -> Option<Vec<u8>> {
    std::fs::read(yangstore::datastore::file_path(layout, module, ds)).ok()
}
