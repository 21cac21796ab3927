pub mod ignore;
pub mod search;
pub mod tree;
pub mod watcher;
