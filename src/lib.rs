// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(warnings)]                    // All warnings are treated as errors
#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![deny(dead_code)]                   // Unused code is forbidden
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![deny(unused_imports)]              // Unused imports are forbidden
#![deny(unused_variables)]            // Unused variables are forbidden
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::module_inception)]    // Module with same name as crate warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::shadow_unrelated)]    // Shadowing unrelated variables warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Terrastack
//!
//! A cross-stack infrastructure planner with locked state coordination.
//!
//! ## Overview
//!
//! Terrastack lets several stacks of infrastructure resources reference each
//! other and be planned and applied as one unit:
//!
//! - Declare resources as plain data, with explicit reference markers
//! - Build one dependency graph across stacks, rejecting cycles and duplicates
//! - Diff the desired graph against the last applied snapshot
//! - Apply through a bounded worker pool that respects dependencies
//! - Coordinate concurrent operators with a per-environment lock
//!
//! ## Architecture
//!
//! A session moves through a fixed pipeline:
//!
//! 1. **Build**: stacks are registered and validated into a [`graph::Graph`]
//! 2. **Lock**: the `(project, environment)` lock is taken on the state backend
//! 3. **Plan**: references are resolved, the snapshot is diffed and
//!    operations are ordered
//! 4. **Apply**: operations run through a [`provisioner::ResourceProvisioner`]
//! 5. **Record**: the new snapshot is written once and the lock released
//!
//! ## Modules
//!
//! - [`config`]: Configuration parsing, validation and content hashing
//! - [`graph`]: Resources, stacks, the dependency graph and reference resolution
//! - [`planner`]: Diffing, operation ordering, plan documents and the apply engine
//! - [`provisioner`]: The seam to whatever actually creates resources
//! - [`state`]: Snapshot storage and locking (memory, local, S3)
//! - [`session`]: Orchestration of one plan or apply run
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! project:
//!   name: shop
//!   environment: prod
//!
//! stacks:
//!   - name: network
//!     resources:
//!       - id: vpc
//!         type: aws_vpc
//!         attributes:
//!           cidrBlock: 10.0.0.0/16
//!   - name: app
//!     resources:
//!       - id: service
//!         type: aws_ecs_service
//!         attributes:
//!           vpcId: { refStack: network, refResourceId: vpc, refOutput: id }
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod error;
pub mod graph;
pub mod planner;
pub mod provisioner;
pub mod session;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigParser, ConfigValidator, ContentHasher, InfraConfig};
pub use error::{Result, TerrastackError};
pub use graph::{Graph, GraphBuilder, Reference, ResourceAddress, ResourceNode, Stack};
pub use planner::{ApplyEngine, OperationKind, OperationList, PlanDocument, Planner, Synthesizer};
pub use provisioner::{ExternalCommandProvisioner, ResourceProvisioner};
pub use session::{Session, SessionReport, SessionSettings};
pub use state::{LocalStateBackend, MemoryStateBackend, S3StateBackend, Snapshot, StateBackend};
