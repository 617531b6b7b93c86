#![doc = "paper-sync-core: everything the paper sync consumer decides, independent of any transport."]

//! Turns publish events for papers into the set of legacy files that should be
//! mirrored, makes sure rendered artifacts exist, and reconciles an object
//! store against that set. Brokers, object stores and render hosts are reached
//! only through the traits in [`contract`].
//!
//! # Usage
//! The binary crate wires GCP implementations of the [`contract`] traits into
//! [`consumer::ConsumerLoop`]; tests use the `mockall` mocks exported under the
//! `test-export-mocks` feature or [`local_store::LocalObjectStore`].

pub mod artifact;
pub mod config;
pub mod consumer;
pub mod contract;
pub mod event;
pub mod file_state;
pub mod identifier;
pub mod local_store;
pub mod reconcile;
pub mod source_flag;
