//! # Custom resource definition module
//!
//! This module provide the custom resource managed by the operator, its
//! structures, implementation and reconciliation loop.

pub mod hotstandby;
