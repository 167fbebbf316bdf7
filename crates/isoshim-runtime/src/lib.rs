//! Task and exec lifecycle management for the isoshim runtime.
//!
//! A [`task::ContainerTask`] owns one container, its init exec, and the
//! registry of additional execs. When the init exec exits, the task's
//! [`teardown::TeardownSequencer`] stops the container, releases its host
//! resources, and closes the isolation boundary the task owns.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod backend;
pub mod events;
pub mod exec;
pub mod registry;
pub mod service;
pub mod spec;
pub mod task;
pub mod teardown;
pub mod testing;
