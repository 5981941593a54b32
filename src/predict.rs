use crate::database::{MovieDb, RatingDb, UserDb};
use std::collections::HashMap;

#[derive(thiserror::Error, Debug)]
pub enum PredictError {
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),
    #[error("unknown user id: {0}")]
    UnknownUser(u64),
    #[error("unknown movie id: {0}")]
    UnknownMovie(u64),
}

/// Read-only view of the rating store. Asking about an id that does not
/// exist is a caller bug and fails, missing ratings are normal results.
pub trait RatingsSource {
    fn user_ratings(&self, user_id: u64) -> Result<HashMap<u64, u8>, PredictError>;
    fn movie_ratings(&self, movie_id: u64) -> Result<Vec<(u64, u8)>, PredictError>;
    fn score(&self, user_id: u64, movie_id: u64) -> Result<Option<u8>, PredictError>;
}

impl RatingsSource for sled::Db {
    fn user_ratings(&self, user_id: u64) -> Result<HashMap<u64, u8>, PredictError> {
        if self.get_user(user_id)?.is_none() {
            return Err(PredictError::UnknownUser(user_id));
        }
        Ok(self
            .ratings_by_user(user_id)?
            .into_iter()
            .map(|(movie_id, rating)| (movie_id, rating.score))
            .collect())
    }

    fn movie_ratings(&self, movie_id: u64) -> Result<Vec<(u64, u8)>, PredictError> {
        if self.get_movie(movie_id)?.is_none() {
            return Err(PredictError::UnknownMovie(movie_id));
        }
        Ok(self
            .ratings_by_movie(movie_id)?
            .into_iter()
            .map(|(user_id, rating)| (user_id, rating.score))
            .collect())
    }

    fn score(&self, user_id: u64, movie_id: u64) -> Result<Option<u8>, PredictError> {
        if self.get_user(user_id)?.is_none() {
            return Err(PredictError::UnknownUser(user_id));
        }
        if self.get_movie(movie_id)?.is_none() {
            return Err(PredictError::UnknownMovie(movie_id));
        }
        Ok(self.rating(user_id, movie_id)?.map(|rating| rating.score))
    }
}

#[derive(serde::Serialize, Debug, Clone, Copy, PartialEq)]
pub enum Basis {
    Neighbors,
    MovieAverage,
}

#[derive(serde::Serialize, Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub score: f64,
    pub basis: Basis,
}

/// Pearson correlation of two users over the movies both have rated.
/// `None` when fewer than two movies are shared or one side has no
/// variance over the shared set; such pairs carry no signal and must be
/// excluded from prediction rather than counted as zero.
pub fn similarity(a: &HashMap<u64, u8>, b: &HashMap<u64, u8>) -> Option<f64> {
    let pairs: Vec<(f64, f64)> = a
        .iter()
        .filter_map(|(movie_id, &x)| b.get(movie_id).map(|&y| (f64::from(x), f64::from(y))))
        .collect();
    pearson(&pairs)
}

fn pearson(pairs: &[(f64, f64)]) -> Option<f64> {
    if pairs.len() < 2 {
        return None;
    }
    let n = pairs.len() as f64;
    let mean_x = pairs.iter().map(|p| p.0).sum::<f64>() / n;
    let mean_y = pairs.iter().map(|p| p.1).sum::<f64>() / n;
    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for &(x, y) in pairs {
        cov += (x - mean_x) * (y - mean_y);
        var_x += (x - mean_x) * (x - mean_x);
        var_y += (y - mean_y) * (y - mean_y);
    }
    if var_x == 0.0 || var_y == 0.0 {
        return None;
    }
    Some(cov / (var_x.sqrt() * var_y.sqrt()))
}

// Anti-correlated neighbors still carry information, but only when no
// positively correlated neighbor is available.
fn prefer_positive(mut neighbors: Vec<(f64, f64)>) -> Vec<(f64, f64)> {
    if neighbors.iter().any(|&(sim, _)| sim > 0.0) {
        neighbors.retain(|&(sim, _)| sim > 0.0);
    }
    neighbors
}

fn weighted_mean(neighbors: &[(f64, f64)]) -> Option<f64> {
    let denom: f64 = neighbors.iter().map(|(sim, _)| sim.abs()).sum();
    if denom == 0.0 {
        return None;
    }
    let num: f64 = neighbors.iter().map(|(sim, score)| sim * score).sum();
    Some(num / denom)
}

/// Estimate the score `user_id` would give `movie_id` from the ratings of
/// correlated neighbors. `Ok(None)` means no usable neighbor exists; that
/// is an expected outcome, not an error.
pub fn predict<S: RatingsSource + ?Sized>(
    source: &S,
    user_id: u64,
    movie_id: u64,
) -> Result<Option<f64>, PredictError> {
    let mut target = source.user_ratings(user_id)?;
    // The target movie must not contribute to similarity even if the
    // target user has somehow rated it.
    target.remove(&movie_id);
    let mut neighbors = Vec::new();
    for (other_id, score) in source.movie_ratings(movie_id)? {
        if other_id == user_id {
            continue;
        }
        let other = source.user_ratings(other_id)?;
        if let Some(sim) = similarity(&target, &other) {
            neighbors.push((sim, f64::from(score)));
        }
    }
    Ok(weighted_mean(&prefer_positive(neighbors)))
}

/// Plain mean of all ratings of the movie, `Ok(None)` when it has none.
pub fn movie_average<S: RatingsSource + ?Sized>(
    source: &S,
    movie_id: u64,
) -> Result<Option<f64>, PredictError> {
    let ratings = source.movie_ratings(movie_id)?;
    if ratings.is_empty() {
        return Ok(None);
    }
    let sum: f64 = ratings.iter().map(|&(_, score)| f64::from(score)).sum();
    Ok(Some(sum / ratings.len() as f64))
}

/// Neighbor-based estimate when one exists, otherwise the movie-wide
/// average. The basis flag tells the caller which one it got, the average
/// ignores the user's taste entirely.
pub fn predict_with_fallback<S: RatingsSource + ?Sized>(
    source: &S,
    user_id: u64,
    movie_id: u64,
) -> Result<Option<Prediction>, PredictError> {
    if let Some(score) = predict(source, user_id, movie_id)? {
        return Ok(Some(Prediction {
            score,
            basis: Basis::Neighbors,
        }));
    }
    Ok(movie_average(source, movie_id)?.map(|score| Prediction {
        score,
        basis: Basis::MovieAverage,
    }))
}
