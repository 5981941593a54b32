use std::collections::{HashMap, HashSet};
use unic_ucd_category::GeneralCategory;

pub fn tokens_iter(s: &str) -> impl Iterator<Item = &str> {
    s.split(|c| !is_token_character(c)).filter(|t| !t.is_empty())
}

pub fn is_token_character(c: char) -> bool {
    let category = GeneralCategory::of(c);
    category.is_number() || category.is_letter() || category == GeneralCategory::PrivateUse
}

const MOVIE_TITLES: &'static [u8] = b"movie_titles";

// Index entries are `token \0 movie_id`. Token characters are letters and
// numbers only, so NUL cannot occur inside a token and the separator keeps
// "star" from prefix-matching entries for "stars".
fn entry_key(token: &str, movie_id: u64) -> Vec<u8> {
    let mut key = token.as_bytes().to_vec();
    key.push(0);
    key.extend_from_slice(&movie_id.to_le_bytes());
    key
}

fn entry_prefix(token: &str) -> Vec<u8> {
    let mut prefix = token.as_bytes().to_vec();
    prefix.push(0);
    prefix
}

pub struct TitleIndex {
    tree: sled::Tree,
}

pub trait TitleIndexExt {
    fn open_title_index(&self) -> sled::Result<TitleIndex>;
}

impl TitleIndexExt for sled::Db {
    fn open_title_index(&self) -> sled::Result<TitleIndex> {
        Ok(TitleIndex {
            tree: self.open_tree(MOVIE_TITLES)?,
        })
    }
}

impl TitleIndex {
    pub fn insert(&self, movie_id: u64, title: &str) -> sled::Result<()> {
        for token in tokens_iter(title) {
            self.tree
                .insert(entry_key(&token.to_lowercase(), movie_id), b"".as_ref())?;
        }
        Ok(())
    }

    /// Movies whose title shares tokens with the query, best match first.
    /// The second element is the number of distinct query tokens matched.
    pub fn query(&self, query: &str) -> sled::Result<Vec<(u64, u32)>> {
        use std::convert::TryInto;
        let tokens: HashSet<String> = tokens_iter(query).map(|t| t.to_lowercase()).collect();
        let mut hits: HashMap<u64, u32> = HashMap::new();
        for token in tokens {
            for entry in self.tree.scan_prefix(entry_prefix(&token)) {
                let (key, _) = entry?;
                let movie_id = u64::from_le_bytes(key[key.len() - 8..].try_into().unwrap());
                *hits.entry(movie_id).or_insert(0) += 1;
            }
        }
        let mut ranked: Vec<(u64, u32)> = hits.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        Ok(ranked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_index() -> (sled::Db, TitleIndex) {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let index = db.open_title_index().unwrap();
        (db, index)
    }

    #[test]
    fn ranks_by_matched_tokens() {
        let (_db, index) = test_index();
        index.insert(1, "Star Wars").unwrap();
        index.insert(2, "Star Trek").unwrap();
        index.insert(3, "Alien").unwrap();
        assert_eq!(index.query("star wars").unwrap(), vec![(1, 2), (2, 1)]);
        assert_eq!(index.query("alien").unwrap(), vec![(3, 1)]);
        assert_eq!(index.query("STAR").unwrap(), vec![(1, 1), (2, 1)]);
    }

    #[test]
    fn partial_tokens_do_not_match() {
        let (_db, index) = test_index();
        index.insert(1, "Alien").unwrap();
        index.insert(2, "Aliens").unwrap();
        assert_eq!(index.query("alien").unwrap(), vec![(1, 1)]);
        assert_eq!(index.query("ali").unwrap(), vec![]);
    }

    #[test]
    fn repeated_tokens_count_once() {
        let (_db, index) = test_index();
        index.insert(1, "New York, New York").unwrap();
        assert_eq!(index.query("new new york").unwrap(), vec![(1, 2)]);
    }
}
