use crate::error::{Error, Result};
use rand::seq::SliceRandom;
use rand::Rng;

/// Realized playback order: acquisition index -> stimulus index and
/// repetition number. Both arrays always have the same length.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StimulusSequence {
    stimuli: Vec<usize>,
    repetitions: Vec<usize>,
}

impl StimulusSequence {
    /// `repeats` blocks of stimuli `0..num_stimuli`. With `randomize`, each
    /// block is shuffled on its own so every block is a permutation.
    pub fn build<R: Rng + ?Sized>(
        num_stimuli: usize,
        repeats: usize,
        randomize: bool,
        rng: &mut R,
    ) -> Self {
        let mut sequence = Self::default();
        sequence.append(0, num_stimuli, repeats, randomize, rng);
        sequence
    }

    pub fn from_parts(stimuli: Vec<usize>, repetitions: Vec<usize>) -> Result<Self> {
        if stimuli.len() != repetitions.len() {
            return Err(Error::DataConsistency(format!(
                "stimulus sequence has {} entries, repetition sequence {}",
                stimuli.len(),
                repetitions.len()
            )));
        }
        Ok(Self {
            stimuli,
            repetitions,
        })
    }

    /// Extends the sequence with `repeats` blocks of stimuli
    /// `first..first + count`. Repetition numbers of the new blocks start at 0.
    pub fn append<R: Rng + ?Sized>(
        &mut self,
        first: usize,
        count: usize,
        repeats: usize,
        randomize: bool,
        rng: &mut R,
    ) {
        let mut block: Vec<usize> = (first..first + count).collect();
        self.stimuli.reserve(count * repeats);
        self.repetitions.reserve(count * repeats);
        for repetition in 0..repeats {
            if randomize {
                block.shuffle(rng);
            }
            self.stimuli.extend_from_slice(&block);
            self.repetitions.extend(std::iter::repeat(repetition).take(count));
        }
    }

    pub fn stimuli(&self) -> &[usize] {
        &self.stimuli
    }

    pub fn repetitions(&self) -> &[usize] {
        &self.repetitions
    }

    pub fn len(&self) -> usize {
        self.stimuli.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stimuli.is_empty()
    }

    /// `(stimulus_index, repetition_index)` of one acquisition index.
    pub fn get(&self, index: usize) -> Option<(usize, usize)> {
        Some((*self.stimuli.get(index)?, *self.repetitions.get(index)?))
    }

    pub fn clear(&mut self) {
        self.stimuli.clear();
        self.repetitions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn ordered_sequence_cycles_through_stimuli() {
        let mut rng = StdRng::seed_from_u64(1);
        let sequence = StimulusSequence::build(3, 2, false, &mut rng);
        assert_eq!(sequence.stimuli(), &[0, 1, 2, 0, 1, 2]);
        assert_eq!(sequence.repetitions(), &[0, 0, 0, 1, 1, 1]);
        assert_eq!(sequence.get(4), Some((1, 1)));
        assert_eq!(sequence.get(6), None);
    }

    #[test]
    fn randomized_blocks_are_permutations() {
        let mut rng = StdRng::seed_from_u64(42);
        let n = 7;
        let sequence = StimulusSequence::build(n, 20, true, &mut rng);
        assert_eq!(sequence.len(), n * 20);
        for block in sequence.stimuli().chunks(n) {
            let mut sorted = block.to_vec();
            sorted.sort_unstable();
            assert_eq!(sorted, (0..n).collect::<Vec<_>>());
        }
        // With 20 blocks of 7 at least one block is out of order
        assert!(sequence
            .stimuli()
            .chunks(n)
            .any(|block| block != (0..n).collect::<Vec<_>>().as_slice()));
    }

    #[test]
    fn append_keeps_existing_entries() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut sequence = StimulusSequence::build(10, 1, true, &mut rng);
        let before = sequence.clone();
        sequence.append(10, 5, 1, true, &mut rng);
        assert_eq!(sequence.len(), 15);
        assert_eq!(&sequence.stimuli()[..10], before.stimuli());
        assert!(sequence.stimuli()[10..].iter().all(|s| (10..15).contains(s)));
        assert!(sequence.repetitions()[10..].iter().all(|&r| r == 0));
    }

    #[test]
    fn from_parts_checks_lengths() {
        assert!(StimulusSequence::from_parts(vec![0, 1], vec![0]).is_err());
        let sequence = StimulusSequence::from_parts(vec![1, 0], vec![0, 0]).unwrap();
        assert_eq!(sequence.get(0), Some((1, 0)));
        assert_eq!(sequence.get(2), None);
    }
}
