// src/shm/mod.rs

//! Process-shared memory: the main segment (module descriptors, counters,
//! locks) and the ext segment (an offset-addressed heap of names, dependency
//! arrays and subscription tables).

pub mod arena;
pub mod file;
pub mod layout;
pub mod main;

pub use arena::ExtShm;
pub use file::ShmFile;
pub use main::MainShm;
