use crate::model::*;
use sled::transaction::{TransactionError, Transactional};

fn serialize_id(id: u64) -> [u8; 8] {
    id.to_le_bytes()
}

fn deserialize_id<V: AsRef<[u8]>>(id: V) -> u64 {
    use std::convert::TryInto;
    u64::from_le_bytes(id.as_ref().try_into().unwrap())
}

/// Key of a rating: owning id first so that `scan_prefix` on one id
/// enumerates the other side of the pair.
fn serialize_pair(a: u64, b: u64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&a.to_le_bytes());
    key[8..].copy_from_slice(&b.to_le_bytes());
    key
}

const USERS: &'static [u8] = b"users";
const USERS_EMAIL: &'static [u8] = b"users_email";
const MOVIES: &'static [u8] = b"movies";
const RATINGS: &'static [u8] = b"ratings";
const RATINGS_MOVIE: &'static [u8] = b"ratings_movie";

pub trait UserDb {
    type Error;
    /// Returns `None` when the email is already taken.
    fn add_user(&self, user: &User) -> Result<Option<u64>, Self::Error>;
    fn get_user(&self, id: u64) -> Result<Option<User>, Self::Error>;
    fn get_user_by_email(&self, email: &str) -> Result<Option<(u64, User)>, Self::Error>;
    fn list_users(&self) -> Result<Vec<(u64, User)>, Self::Error>;
}

pub trait MovieDb {
    type Error;
    fn add_movie(&self, movie: &Movie) -> Result<u64, Self::Error>;
    fn get_movie(&self, id: u64) -> Result<Option<Movie>, Self::Error>;
    fn list_movies(&self) -> Result<Vec<(u64, Movie)>, Self::Error>;
}

pub trait RatingDb {
    type Error;
    /// Upsert: a second rating for the same (user, movie) pair replaces
    /// the first, it never creates a duplicate row.
    fn rate(&self, user_id: u64, movie_id: u64, rating: &Rating) -> Result<(), Self::Error>;
    fn rating(&self, user_id: u64, movie_id: u64) -> Result<Option<Rating>, Self::Error>;
    fn ratings_by_user(&self, user_id: u64) -> Result<Vec<(u64, Rating)>, Self::Error>;
    fn ratings_by_movie(&self, movie_id: u64) -> Result<Vec<(u64, Rating)>, Self::Error>;
}

impl UserDb for sled::Db {
    type Error = sled::Error;

    fn add_user(&self, user: &User) -> sled::Result<Option<u64>> {
        let users = self.open_tree(USERS)?;
        let users_email = self.open_tree(USERS_EMAIL)?;
        let id = self.generate_id()?;
        if let Err(err) = (&users, &users_email).transaction(|(users, users_email)| {
            users.insert(&serialize_id(id), bincode::serialize(user).unwrap())?;
            if let Some(_) = users_email.insert(user.email.as_bytes(), &serialize_id(id))? {
                sled::transaction::abort(())?;
            }
            Ok(())
        }) {
            match err {
                TransactionError::Storage(e) => return Err(e),
                TransactionError::Abort(_) => return Ok(None),
            };
        }
        Ok(Some(id))
    }

    fn get_user(&self, id: u64) -> sled::Result<Option<User>> {
        let users = self.open_tree(USERS)?;
        Ok(users
            .get(serialize_id(id))?
            .map(|d| bincode::deserialize(&d).unwrap()))
    }

    fn get_user_by_email(&self, email: &str) -> sled::Result<Option<(u64, User)>> {
        let users_email = self.open_tree(USERS_EMAIL)?;
        let users = self.open_tree(USERS)?;
        if let Some(id) = users_email.get(email)? {
            let user =
                bincode::deserialize(&users.get(&id)?.expect("Bad index users_email")).unwrap();
            Ok(Some((deserialize_id(id), user)))
        } else {
            Ok(None)
        }
    }

    fn list_users(&self) -> sled::Result<Vec<(u64, User)>> {
        let users = self.open_tree(USERS)?;
        users
            .iter()
            .map(|entry| {
                entry.map(|(id, d)| (deserialize_id(id), bincode::deserialize(&d).unwrap()))
            })
            .collect()
    }
}

impl MovieDb for sled::Db {
    type Error = sled::Error;

    fn add_movie(&self, movie: &Movie) -> sled::Result<u64> {
        let movies = self.open_tree(MOVIES)?;
        let id = self.generate_id()?;
        movies.insert(&serialize_id(id), bincode::serialize(movie).unwrap())?;
        Ok(id)
    }

    fn get_movie(&self, id: u64) -> sled::Result<Option<Movie>> {
        let movies = self.open_tree(MOVIES)?;
        Ok(movies
            .get(serialize_id(id))?
            .map(|d| bincode::deserialize(&d).unwrap()))
    }

    fn list_movies(&self) -> sled::Result<Vec<(u64, Movie)>> {
        let movies = self.open_tree(MOVIES)?;
        movies
            .iter()
            .map(|entry| {
                entry.map(|(id, d)| (deserialize_id(id), bincode::deserialize(&d).unwrap()))
            })
            .collect()
    }
}

impl RatingDb for sled::Db {
    type Error = sled::Error;

    fn rate(&self, user_id: u64, movie_id: u64, rating: &Rating) -> sled::Result<()> {
        let ratings = self.open_tree(RATINGS)?;
        let ratings_movie = self.open_tree(RATINGS_MOVIE)?;
        let data = bincode::serialize(rating).unwrap();
        // Both the primary row and the by-movie index row must land in the
        // same transaction; readers scan either tree on its own.
        (&ratings, &ratings_movie)
            .transaction(|(ratings, ratings_movie)| {
                ratings.insert(&serialize_pair(user_id, movie_id), data.clone())?;
                ratings_movie.insert(&serialize_pair(movie_id, user_id), data.clone())?;
                Ok(())
            })
            .map_err(|err: TransactionError<()>| match err {
                TransactionError::Storage(e) => e,
                TransactionError::Abort(()) => unreachable!(),
            })
    }

    fn rating(&self, user_id: u64, movie_id: u64) -> sled::Result<Option<Rating>> {
        let ratings = self.open_tree(RATINGS)?;
        Ok(ratings
            .get(&serialize_pair(user_id, movie_id))?
            .map(|d| bincode::deserialize(&d).unwrap()))
    }

    fn ratings_by_user(&self, user_id: u64) -> sled::Result<Vec<(u64, Rating)>> {
        let ratings = self.open_tree(RATINGS)?;
        ratings
            .scan_prefix(&serialize_id(user_id))
            .map(|entry| {
                entry.map(|(key, d)| {
                    (
                        deserialize_id(&key[8..]),
                        bincode::deserialize(&d).unwrap(),
                    )
                })
            })
            .collect()
    }

    fn ratings_by_movie(&self, movie_id: u64) -> sled::Result<Vec<(u64, Rating)>> {
        let ratings_movie = self.open_tree(RATINGS_MOVIE)?;
        ratings_movie
            .scan_prefix(&serialize_id(movie_id))
            .map(|entry| {
                entry.map(|(key, d)| {
                    (
                        deserialize_id(&key[8..]),
                        bincode::deserialize(&d).unwrap(),
                    )
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> sled::Db {
        sled::Config::new().temporary(true).open().unwrap()
    }

    fn user(email: &str) -> User {
        User {
            email: email.to_owned(),
            password_hash: "$2b$irrelevant".to_owned(),
            age: 30,
            zipcode: "94103".to_owned(),
        }
    }

    #[test]
    fn duplicate_email_is_rejected() {
        let db = test_db();
        assert!(db.add_user(&user("a@example.com")).unwrap().is_some());
        assert!(db.add_user(&user("a@example.com")).unwrap().is_none());
        assert!(db.add_user(&user("b@example.com")).unwrap().is_some());
        assert_eq!(db.list_users().unwrap().len(), 2);
    }

    #[test]
    fn email_index_roundtrip() {
        let db = test_db();
        let id = db.add_user(&user("a@example.com")).unwrap().unwrap();
        let (found_id, found) = db.get_user_by_email("a@example.com").unwrap().unwrap();
        assert_eq!(found_id, id);
        assert_eq!(found.email, "a@example.com");
        assert!(db.get_user_by_email("nobody@example.com").unwrap().is_none());
    }

    #[test]
    fn rating_is_upserted() {
        let db = test_db();
        let u = db.add_user(&user("a@example.com")).unwrap().unwrap();
        let m = db
            .add_movie(&Movie {
                title: "Pulp Fiction".to_owned(),
                released_at: None,
                imdb_url: None,
            })
            .unwrap();
        db.rate(u, m, &Rating { score: 2 }).unwrap();
        db.rate(u, m, &Rating { score: 4 }).unwrap();
        assert_eq!(db.rating(u, m).unwrap(), Some(Rating { score: 4 }));
        assert_eq!(db.ratings_by_user(u).unwrap(), vec![(m, Rating { score: 4 })]);
        assert_eq!(db.ratings_by_movie(m).unwrap(), vec![(u, Rating { score: 4 })]);
    }

    #[test]
    fn scans_stay_per_key() {
        let db = test_db();
        let u1 = db.add_user(&user("a@example.com")).unwrap().unwrap();
        let u2 = db.add_user(&user("b@example.com")).unwrap().unwrap();
        let m1 = db
            .add_movie(&Movie {
                title: "Alien".to_owned(),
                released_at: None,
                imdb_url: None,
            })
            .unwrap();
        let m2 = db
            .add_movie(&Movie {
                title: "Aliens".to_owned(),
                released_at: None,
                imdb_url: None,
            })
            .unwrap();
        db.rate(u1, m1, &Rating { score: 5 }).unwrap();
        db.rate(u1, m2, &Rating { score: 3 }).unwrap();
        db.rate(u2, m1, &Rating { score: 1 }).unwrap();
        assert_eq!(db.ratings_by_user(u1).unwrap().len(), 2);
        assert_eq!(db.ratings_by_user(u2).unwrap().len(), 1);
        assert_eq!(db.ratings_by_movie(m1).unwrap().len(), 2);
        assert_eq!(db.ratings_by_movie(m2).unwrap().len(), 1);
    }
}
