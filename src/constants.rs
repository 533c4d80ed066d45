//! Configuration limits for the quiz engine
//!
//! This module contains the bounds used to validate questions, participant
//! names and timing settings so every layer agrees on the same limits.

/// Quiz-wide limits
pub mod quiz {
    /// Maximum number of questions in one quiz round
    pub const MAX_QUESTION_COUNT: usize = 200;
    /// Maximum number of participants that may join a single round
    pub const MAX_PARTICIPANT_COUNT: usize = 1000;
    /// Number of leaderboard entries included in push and HTTP payloads
    pub const LEADERBOARD_LIMIT: usize = 50;
}

/// Question content limits
pub mod question {
    /// Maximum length of a question id
    pub const MAX_ID_LENGTH: usize = 64;
    /// Maximum length of the question text
    pub const MAX_TEXT_LENGTH: usize = 500;
    /// Minimum number of answer options
    pub const MIN_OPTION_COUNT: usize = 2;
    /// Maximum number of answer options
    pub const MAX_OPTION_COUNT: usize = 8;
    /// Maximum length of a single answer option
    pub const MAX_OPTION_LENGTH: usize = 200;
    /// Maximum length of an image URL
    pub const MAX_URL_LENGTH: usize = 2048;
}

/// Participant limits
pub mod participant {
    /// Maximum length of a participant name in bytes
    pub const MAX_NAME_LENGTH: usize = 30;
}

/// Timer bounds
pub mod timer {
    /// Minimum answering time in seconds
    pub const MIN_TIMER_MAX: u64 = 5;
    /// Maximum answering time in seconds
    pub const MAX_TIMER_MAX: u64 = 600;
    /// Maximum lead before a question starts, in seconds
    pub const MAX_QUESTION_LEAD: u64 = 30;
    /// Maximum lead between a step transition notice and its activation, in seconds
    pub const MAX_ACTIVATION_LEAD: u64 = 10;
    /// Minimum tick interval in milliseconds
    pub const MIN_TICK_INTERVAL_MS: u64 = 10;
    /// Maximum tick interval in milliseconds
    pub const MAX_TICK_INTERVAL_MS: u64 = 1000;
}

/// Push channel limits
pub mod push {
    /// Number of messages buffered per connected client before it is pruned
    pub const CLIENT_BUFFER: usize = 64;
}
