//! Process bootstrap helpers shared by binaries and embedding applications.

pub mod bootstrap;
