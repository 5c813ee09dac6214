pub mod virtualservices;
pub mod workspacekinds;
pub mod workspaces;
