//! Property tests for the detector, accumulator and exporter.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use proptest::prelude::*;
use pulse_train_daq::decoder::{decode, BitWidth};
use pulse_train_daq::detector::ChangeDetector;
use pulse_train_daq::export::{ExportFormat, VersionedExporter};
use pulse_train_daq::ground_truth::parse_pattern;
use pulse_train_daq::pulse_train::{PulseTrainAccumulator, StepOrigin};

fn mask(width: u8) -> u8 {
    ((1u16 << width) - 1) as u8
}

/// Width plus a byte sequence whose consecutive masked values all differ.
fn changing_sequence() -> impl Strategy<Value = (u8, Vec<u8>)> {
    (1u8..=8).prop_flat_map(|width| {
        (Just(width), prop::collection::vec(any::<u8>(), 1..64)).prop_map(|(width, mut bytes)| {
            bytes.dedup_by(|b, a| (*a & mask(width)) == (*b & mask(width)));
            (width, bytes)
        })
    })
}

proptest! {
    #[test]
    fn step_value_is_the_masked_byte(byte in any::<u8>(), width in 1u8..=8) {
        let vector = decode(byte, BitWidth::new(width).unwrap());
        prop_assert_eq!(vector.width(), width as usize);
        prop_assert_eq!(vector.step_value(), u32::from(byte & mask(width)));
        prop_assert_eq!(vector.bits()[0], byte & 1 == 1);
    }

    #[test]
    fn changing_sequence_emits_n_minus_one_events((width, bytes) in changing_sequence()) {
        let mut detector = ChangeDetector::new(BitWidth::new(width).unwrap());
        let events: Vec<_> = bytes.iter().filter_map(|b| detector.observe(*b)).collect();
        prop_assert_eq!(events.len(), bytes.len() - 1);
        let values: Vec<u32> = events.iter().map(|e| e.step_value).collect();
        let expected: Vec<u32> = bytes[1..].iter().map(|b| u32::from(b & mask(width))).collect();
        prop_assert_eq!(values, expected);
    }

    #[test]
    fn repeated_byte_emits_nothing_after_baseline(byte in any::<u8>(), width in 1u8..=8, repeats in 1usize..100) {
        let mut detector = ChangeDetector::new(BitWidth::new(width).unwrap());
        let events = std::iter::repeat(byte).take(repeats).filter_map(|b| detector.observe(b)).count();
        prop_assert_eq!(events, 0);
    }

    #[test]
    fn indices_are_contiguous_and_summary_is_the_concatenation(
        (width, bytes) in changing_sequence(),
        origin in prop_oneof![Just(StepOrigin::Zero), Just(StepOrigin::One)],
    ) {
        let mut detector = ChangeDetector::new(BitWidth::new(width).unwrap());
        let mut accumulator = PulseTrainAccumulator::new("press", 1, origin);
        let t0 = Instant::now();
        let mut steps = Vec::new();
        for (i, byte) in bytes.iter().enumerate() {
            if let Some(change) = detector.observe_at(*byte, t0 + Duration::from_millis(10 * i as u64)) {
                steps.push(accumulator.append(&change).step);
            }
        }

        let first = origin.first_index();
        let expected: Vec<u64> = (first..first + steps.len() as u64).collect();
        prop_assert_eq!(steps, expected);

        let summary = parse_pattern(&accumulator.summary().pattern).unwrap();
        let in_step_order: Vec<u32> = accumulator.records().iter().map(|r| r.step_value).collect();
        prop_assert_eq!(summary, in_step_order);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn exports_never_collide_or_alter_earlier_files(contents in prop::collection::vec("[a-z]{0,12}", 1..8)) {
        let dir = tempfile::tempdir().unwrap();
        let exporter = VersionedExporter::new(dir.path());

        let mut paths = Vec::new();
        for content in &contents {
            let path = exporter.export("press_1", ExportFormat::Txt, content.as_bytes()).unwrap();
            paths.push(path);
        }

        let unique: HashSet<_> = paths.iter().collect();
        prop_assert_eq!(unique.len(), contents.len());
        for (path, content) in paths.iter().zip(&contents) {
            prop_assert_eq!(&std::fs::read_to_string(path).unwrap(), content);
        }
        prop_assert_eq!(paths[0].file_name().unwrap().to_str().unwrap(), "press_1.txt");
        for (i, path) in paths.iter().enumerate().skip(1) {
            let expected = format!("press_1_v{i}.txt");
            prop_assert_eq!(path.file_name().unwrap().to_str().unwrap(), expected.as_str());
        }
    }
}
