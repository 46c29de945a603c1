use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use spike_epochs::acquisition::{EpochStore, RawEpochReader};
use spike_epochs::config::{AcquisitionConfig, SpikeConfig};
use spike_epochs::spikes::SpikeStore;
use spike_epochs::stimulus::StimulusSequence;

const FS: f64 = 10_000.0;

fn store(num_channels: usize, epoch_samples: usize) -> EpochStore {
    EpochStore::new(&AcquisitionConfig {
        sample_rate: FS,
        num_channels,
        epoch_samples,
        ..AcquisitionConfig::default()
    })
    .unwrap()
}

/// Feeds `channels` (one full-length signal per channel) in blocks of `block`.
fn feed(store: &EpochStore, channels: &[Vec<f32>], block: usize) {
    let len = channels[0].len();
    let mut offset = 0;
    while offset < len {
        let end = (offset + block).min(len);
        let views: Vec<&[f32]> = channels.iter().map(|c| &c[offset..end]).collect();
        store.sound_proc(&views, false);
        offset = end;
    }
}

fn noisy_spikes(rng: &mut StdRng, len: usize, spikes: &[usize]) -> Vec<f32> {
    let mut samples: Vec<f32> = (0..len).map(|_| rng.gen_range(-0.1f32..0.1)).collect();
    for &p in spikes {
        samples[p] = 1.0;
        samples[p + 1] = 0.7;
        samples[p + 2] = -0.3;
    }
    samples
}

#[test]
fn exactly_one_epoch_after_one_epoch_of_samples() {
    for &(num_channels, epoch_samples, block) in
        &[(1, 1, 1), (2, 1000, 64), (3, 17, 5), (8, 64, 64), (4, 300, 1024)]
    {
        let store = store(num_channels, epoch_samples);
        store.initialize(num_channels, epoch_samples).unwrap();
        let channels = vec![vec![0.25f32; epoch_samples]; num_channels];
        feed(&store, &channels, block);

        assert_eq!(store.pending_count(), 1, "C={} L={}", num_channels, epoch_samples);
        let (epoch, is_last) = store.pop().unwrap();
        assert!(is_last);
        assert_eq!(epoch.num_channels(), num_channels);
        assert_eq!(epoch.num_samples(), Some(epoch_samples));
        assert!(store.pop().is_none());
    }
}

#[test]
fn scenario_a_single_crossing_on_channel_zero() {
    let store = store(2, 1000);
    store.initialize(2, 1000).unwrap();
    store.set_threshold(0, 0.5).unwrap();
    store.set_threshold(1, 0.5).unwrap();

    let mut ch0 = vec![0.0f32; 1000];
    for s in ch0.iter_mut().skip(500).take(5) {
        *s = 1.0;
    }
    let ch1 = vec![0.0f32; 1000];
    feed(&store, &[ch0, ch1], 256);

    let (epoch, _) = store.pop().unwrap();
    let mut spikes = SpikeStore::new(2, FS, SpikeConfig::default());
    spikes.add(&epoch).unwrap();
    assert_eq!(spikes.num_spikes(0).unwrap(), 1);
    assert_eq!(spikes.spike_position(0, 0).unwrap(), 500);
    assert_eq!(spikes.num_spikes(1).unwrap(), 0);
}

#[test]
fn crossings_whose_snippet_leaves_the_epoch_produce_no_spike() {
    let geometry = SpikeConfig::default();
    let store = store(1, 200);
    store.set_threshold(0, 0.5).unwrap();

    // Last position whose window still fits: 200 - spike_length - post_threshold
    let last_fit = 200 - geometry.spike_length - geometry.post_threshold;
    let mut samples = vec![0.0f32; 200];
    samples[3] = 1.0;
    samples[100] = 1.0;
    samples[last_fit + 1] = 1.0;
    feed(&store, &[samples], 200);

    let (epoch, _) = store.pop().unwrap();
    let mut spikes = SpikeStore::new(1, FS, geometry);
    spikes.add(&epoch).unwrap();
    assert_eq!(spikes.num_spikes(0).unwrap(), 1);
    assert_eq!(spikes.spike_position(0, 0).unwrap(), 100);
    assert_eq!(
        spikes.spike(0, 0).unwrap().waveform.len(),
        geometry.pre_threshold + geometry.spike_length + geometry.post_threshold
    );
}

#[test]
fn remove_then_add_reproduces_spikes() {
    let mut rng = StdRng::seed_from_u64(5);
    let store = store(2, 2000);
    store.load_thresholds(&[0.5, -0.2]).unwrap();
    for _ in 0..3 {
        let ch0 = noisy_spikes(&mut rng, 2000, &[100, 700, 1500]);
        let ch1 = noisy_spikes(&mut rng, 2000, &[400, 1200]);
        feed(&store, &[ch0, ch1], 333);
    }

    let mut spikes = SpikeStore::new(2, FS, SpikeConfig::default());
    let mut epochs = Vec::new();
    while let Some((epoch, _)) = store.pop() {
        spikes.add(&epoch).unwrap();
        epochs.push(epoch);
    }
    let before: Vec<_> = (0..2).map(|ch| spikes.spikes(ch).unwrap().to_vec()).collect();
    assert!(before[0].len() >= 9);

    for ch in 0..2 {
        spikes.remove(ch, 1).unwrap();
    }
    assert!(spikes.spikes(0).unwrap().iter().all(|s| s.epoch_index != 1));
    spikes.add(&epochs[1]).unwrap();

    for ch in 0..2 {
        assert_eq!(spikes.spikes(ch).unwrap(), before[ch].as_slice());
    }
}

#[test]
fn saved_epochs_reload_bit_exact() {
    let path = std::env::temp_dir().join(format!("spike_epochs_it_round_{}.bin", std::process::id()));
    let mut rng = StdRng::seed_from_u64(9);
    let num_epochs = 5;

    let live = store(3, 500);
    live.load_thresholds(&[0.5, 0.5, 0.5]).unwrap();
    live.init_save(&path).unwrap();
    for _ in 0..num_epochs {
        let channels: Vec<Vec<f32>> = (0..3)
            .map(|_| noisy_spikes(&mut rng, 500, &[50, 250]))
            .collect();
        feed(&live, &channels, 128);
    }
    assert_eq!(live.done_save().unwrap(), num_epochs);

    let mut live_spikes = SpikeStore::new(3, FS, SpikeConfig::default());
    let mut live_epochs = Vec::new();
    while let Some((epoch, _)) = live.pop() {
        live_spikes.add(&epoch).unwrap();
        live_epochs.push(epoch);
    }

    let offline = store(3, 500);
    let mut offline_spikes = SpikeStore::new(3, FS, SpikeConfig::default());
    let mut reader = RawEpochReader::open(&path, 3, 500).unwrap();
    assert_eq!(reader.num_records(), num_epochs);
    for original in &live_epochs {
        let samples = reader.read_record().unwrap().unwrap();
        let epoch = offline
            .push(samples, original.thresholds.clone(), original.stimulus_index, original.repetition_index)
            .unwrap();
        assert_eq!(epoch.index, original.index);
        for ch in 0..3 {
            let a: Vec<u32> = epoch.channel(ch).unwrap().iter().map(|s| s.to_bits()).collect();
            let b: Vec<u32> = original.channel(ch).unwrap().iter().map(|s| s.to_bits()).collect();
            assert_eq!(a, b);
        }
        offline_spikes.add(&epoch).unwrap();
    }
    for ch in 0..3 {
        assert_eq!(offline_spikes.spikes(ch).unwrap(), live_spikes.spikes(ch).unwrap());
    }
    std::fs::remove_file(&path).ok();
}

#[test]
fn randomized_sequence_blocks_are_permutations() {
    let mut rng = StdRng::seed_from_u64(123);
    for &(n, repeats) in &[(1, 5), (2, 10), (10, 3), (31, 4)] {
        let sequence = StimulusSequence::build(n, repeats, true, &mut rng);
        assert_eq!(sequence.len(), n * repeats);
        for (r, block) in sequence.stimuli().chunks(n).enumerate() {
            let mut seen = vec![false; n];
            for &s in block {
                assert!(!seen[s], "stimulus {} twice in block {}", s, r);
                seen[s] = true;
            }
            assert!(sequence.repetitions()[r * n..(r + 1) * n].iter().all(|&x| x == r));
        }
    }
}

#[test]
fn scenario_b_append_extends_sequence() {
    let mut rng = StdRng::seed_from_u64(77);
    let mut sequence = StimulusSequence::build(10, 1, true, &mut rng);
    let original = sequence.stimuli().to_vec();

    sequence.append(10, 5, 1, true, &mut rng);
    assert_eq!(sequence.len(), 15);
    assert_eq!(sequence.repetitions().len(), 15);
    assert_eq!(&sequence.stimuli()[..10], original.as_slice());
    assert!(sequence.stimuli()[10..].iter().all(|s| (10..=14).contains(s)));
}

#[test]
fn pause_discards_partial_epoch_and_keeps_indices() {
    let store = store(1, 100);
    let sequence = StimulusSequence::from_parts((0..10).collect(), vec![0; 10]).unwrap();
    store.arm(&sequence);

    let epoch = vec![0.0f32; 100];
    for _ in 0..3 {
        feed(&store, &[epoch.clone()], 100);
    }
    // Half an epoch, then pause: the partial epoch is dropped
    feed(&store, &[vec![0.0f32; 50]], 50);
    store.pause();
    feed(&store, &[epoch.clone()], 100);
    assert_eq!(store.next_index(), 3);

    store.resume();
    for _ in 0..12 {
        feed(&store, &[epoch.clone()], 100);
    }
    let indices: Vec<usize> = std::iter::from_fn(|| store.pop()).map(|(e, _)| e.index).collect();
    assert_eq!(indices, (0..10).collect::<Vec<_>>());
    assert!(store.status().finished);
}
