//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module     | Commands handled                              |
//! |------------|-----------------------------------------------|
//! | `project`  | `Init`                                        |
//! | `run`      | `Start`, `Advance`, `Abort`, `Resume`, `Jump` |
//! | `gate`     | `Approve`, `Reject`, `Review`                 |
//! | `phase`    | `Status`, `List`                              |
//! | `validate` | `Validate`                                    |

pub mod gate;
pub mod phase;
pub mod project;
pub mod run;
pub mod validate;

pub use gate::{cmd_approve, cmd_reject, cmd_review};
pub use phase::{cmd_list, cmd_status};
pub use project::cmd_init;
pub use run::{cmd_abort, cmd_advance, cmd_jump, cmd_resume, cmd_start};
pub use validate::cmd_validate;
