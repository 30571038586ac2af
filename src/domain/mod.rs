//! Domain types: tasks, organizations, and memberships.

pub mod organization;
pub mod task;

pub use organization::{Invitation, MemberRole, Membership, Organization};
pub use task::{NewTask, Task, TaskPatch};
