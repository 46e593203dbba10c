// v-connect-chat 库入口 / v-connect-chat library entry
//
// 二进制（main.rs）负责装配，库内组件均通过构造函数显式注入
// The binary does the wiring, components receive their collaborators explicitly

pub mod broker;
pub mod config;
pub mod domain;
pub mod error;
pub mod presence;
pub mod registry;
pub mod server;
pub mod service;
pub mod storage;
pub mod worker;
pub mod ws;

pub use server::ChatServer;
