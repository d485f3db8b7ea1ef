//! Ambulance dispatch over real street networks.
//!
//! Routes several ambulances from one base to emergencies of different
//! severity by solving a multi-commodity minimum-cost flow problem: one
//! commodity per emergency, binary flow per street, each street used by at
//! most one ambulance, and only streets whose speed capacity meets the
//! emergency's required speed.
//!
//! # Pipeline
//!
//! - [`network`]: OSM street graph from Overpass API
//! - [`capacity`] and [`emergency`]: randomized scenario per session
//! - [`model`]: the flow LP, independent of any backend
//! - [`solver`]: `good_lp` + `microlp` behind the [`solver::LpSolver`] trait
//! - [`extract`]: routes and metrics from solved variables
//! - [`planner`]: reachability screening and conflict attribution
//! - [`api`]: session controls and map payload over HTTP

pub mod api;
pub mod capacity;
pub mod config;
pub mod console;
pub mod demo_data;
pub mod dto;
pub mod emergency;
pub mod extract;
pub mod geometry;
pub mod model;
pub mod network;
pub mod planner;
pub mod session;
pub mod solver;
