//! Aggregates stored through the update engine and their typed stores.

pub mod auth_session;
pub mod login_failure;
pub mod user_session;
pub mod workflow;

pub use auth_session::{AuthenticationSessionStore, AuthenticationSessionTab, RootAuthenticationSession};
pub use login_failure::{LoginFailure, LoginFailureStore};
pub use user_session::{ClientSession, SessionState, StateTransitionError, UserSession, UserSessionStore};
pub use workflow::{WorkflowSchedule, WorkflowScheduleStore};
