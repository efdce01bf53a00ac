use rand::Rng;

use super::types::{PublishError, PublishResult};

const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Shortest tag accepted. 36^7 is about 7.8e10 tags per repository.
pub const MIN_TAG_LENGTH: usize = 7;

const DEFAULT_MAX_ATTEMPTS: u32 = 16;

/// Generates random lowercase alphanumeric tags, re-rolling on collision with the
/// repository's existing tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagGenerator {
    length: usize,
    max_attempts: u32,
}

impl TagGenerator {
    pub fn new(length: usize) -> PublishResult<Self> {
        if length < MIN_TAG_LENGTH {
            return Err(PublishError::InvalidPolicy(format!(
                "tags must be at least {MIN_TAG_LENGTH} characters, got {length}"
            )));
        }
        Ok(TagGenerator {
            length,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        })
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn generate<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        repository: &str,
        taken: impl Fn(&str) -> bool,
    ) -> PublishResult<String> {
        for _ in 0..self.max_attempts {
            let tag: String = (0..self.length)
                .map(|_| char::from(ALPHABET[rng.gen_range(0..ALPHABET.len())]))
                .collect();
            if !taken(&tag) {
                return Ok(tag);
            }
        }
        Err(PublishError::TagSpaceExhausted {
            repository: repository.to_string(),
            attempts: self.max_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use rand::{SeedableRng, rngs::StdRng};

    use super::*;

    #[test]
    fn short_tags_are_rejected() {
        assert!(matches!(TagGenerator::new(6), Err(PublishError::InvalidPolicy(_))));
        assert_eq!(TagGenerator::new(7).unwrap().length(), 7);
    }

    #[test]
    fn tags_use_the_fixed_alphabet() {
        let generator = TagGenerator::new(12).unwrap();
        let tag = generator.generate(&mut StdRng::seed_from_u64(7), "repo", |_| false).unwrap();
        assert_eq!(tag.len(), 12);
        assert!(tag.bytes().all(|b| ALPHABET.contains(&b)));
    }

    #[test]
    fn collisions_are_rerolled() {
        let generator = TagGenerator::new(7).unwrap();
        let first = generator.generate(&mut StdRng::seed_from_u64(1), "repo", |_| false).unwrap();

        // Same seed replays the same first draw, which is now taken.
        let taken = BTreeSet::from([first.clone()]);
        let second = generator
            .generate(&mut StdRng::seed_from_u64(1), "repo", |tag| taken.contains(tag))
            .unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn exhaustion_is_reported() {
        let generator = TagGenerator::new(7).unwrap().with_max_attempts(3);
        let err = generator.generate(&mut StdRng::seed_from_u64(1), "repo", |_| true).unwrap_err();
        assert!(matches!(err, PublishError::TagSpaceExhausted { attempts: 3, .. }));
    }
}
