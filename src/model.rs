use serde::{Deserialize, Serialize};

/// Bounds of the score scale.
pub const SCORE_MIN: u8 = 1;
pub const SCORE_MAX: u8 = 5;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct User {
    pub email: String,
    pub password_hash: String,
    pub age: u32,
    pub zipcode: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Movie {
    pub title: String,
    pub released_at: Option<String>,
    pub imdb_url: Option<String>,
}

/// The (user, movie) pair a rating belongs to lives in the storage key.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Rating {
    pub score: u8,
}
