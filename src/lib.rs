//
// Copyright (c) 2020 Nathan Fiedler
//
#[macro_use]
extern crate failure_derive;

pub mod block;
pub mod core;
pub mod database;
pub mod datastore;
pub mod engine;
pub mod store;
