//! FTP protocol implementation: command parsing, reply rendering and the
//! verb handlers, wired together by the dispatcher in [`ftp`].

pub mod command;
pub mod ftp;
pub mod reply;
pub mod site;
