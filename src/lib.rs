//! Pantry Hub Bridge
//!
//! Connects household-inventory input surfaces to a home-automation hub.
//!
//! This library provides:
//! - A persistent, namespaced key-value store
//! - Delegated (OAuth) and long-lived token authentication
//! - A hub connection service with bounded retry and subscription multiplexing
//! - A registry of pluggable feature modules (scale, barcode scanner)
//! - Per-input targeting state machines projected onto an input surface

pub mod auth;
pub mod bus;
pub mod config;
pub mod connection;
pub mod controller;
pub mod hub;
pub mod model;
pub mod modules;
pub mod store;
pub mod surface;
