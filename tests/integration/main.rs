//! Integration tests: full loan cycles against a scripted exchange under
//! paused tokio time.

mod mock_exchange;
mod scenarios;
