//! Scenarios that wire a management-server dispatcher to an in-process agent
//! and drive jobs across both.

mod jobs;
mod support;
