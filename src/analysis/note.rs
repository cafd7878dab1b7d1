// Frequency to note mapping
//
// Equal temperament around a configurable A4 reference. MIDI note 69 is A4.

use serde::{Deserialize, Serialize};

/// Chromatic note names starting at C
pub const NOTE_NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

/// Default tuning reference in Hz
pub const DEFAULT_REFERENCE_HZ: f32 = 440.0;

/// Note name, octave and cents offset for one frequency
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteReading {
    pub note: &'static str,
    pub octave: i32,
    /// Offset from the nearest note, in [-50, 49]
    pub cents: i32,
}

/// Map `frequency_hz` to the nearest equal-tempered note
///
/// Returns `None` for non-positive or non-finite input, where the logarithm
/// has no meaning.
pub fn map_frequency(frequency_hz: f32, reference_hz: f32) -> Option<NoteReading> {
    if !(frequency_hz.is_finite() && frequency_hz > 0.0) {
        return None;
    }
    let reference = if reference_hz.is_finite() && reference_hz > 0.0 {
        reference_hz
    } else {
        DEFAULT_REFERENCE_HZ
    };

    let n = 69.0 + 12.0 * (frequency_hz as f64 / reference as f64).log2();
    let midi = n.round();
    let mut cents = ((n - midi) * 100.0).round() as i32;
    // A half-way value rounds the note up and yields +50; fold it onto -50
    // of the next note so cents stay in [-50, 49].
    let mut midi = midi as i32;
    if cents >= 50 {
        cents -= 100;
        midi += 1;
    }

    Some(NoteReading {
        note: NOTE_NAMES[midi.rem_euclid(12) as usize],
        octave: midi.div_euclid(12) - 1,
        cents,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concert_a() {
        let reading = map_frequency(440.0, 440.0).unwrap();
        assert_eq!(reading.note, "A");
        assert_eq!(reading.octave, 4);
        assert_eq!(reading.cents, 0);

        let reading = map_frequency(880.0, 440.0).unwrap();
        assert_eq!(reading.note, "A");
        assert_eq!(reading.octave, 5);
        assert_eq!(reading.cents, 0);
    }

    #[test]
    fn test_guitar_strings() {
        let low_e = map_frequency(82.41, 440.0).unwrap();
        assert_eq!((low_e.note, low_e.octave), ("E", 2));

        let g = map_frequency(196.0, 440.0).unwrap();
        assert_eq!((g.note, g.octave), ("G", 3));

        let middle_c = map_frequency(261.63, 440.0).unwrap();
        assert_eq!((middle_c.note, middle_c.octave), ("C", 4));
        assert_eq!(middle_c.cents, 0);
    }

    #[test]
    fn test_cents_sign() {
        // 10 cents sharp of A4
        let sharp = map_frequency(440.0 * 2f32.powf(10.0 / 1200.0), 440.0).unwrap();
        assert_eq!(sharp.note, "A");
        assert_eq!(sharp.cents, 10);

        let flat = map_frequency(440.0 * 2f32.powf(-20.0 / 1200.0), 440.0).unwrap();
        assert_eq!(flat.note, "A");
        assert_eq!(flat.cents, -20);
    }

    #[test]
    fn test_cents_range_over_sweep() {
        let mut f = 20.0f32;
        while f < 5000.0 {
            let reading = map_frequency(f, 440.0).unwrap();
            assert!((-50..=49).contains(&reading.cents), "{} Hz -> {}", f, reading.cents);
            assert!(NOTE_NAMES.contains(&reading.note));
            f *= 1.0013;
        }
    }

    #[test]
    fn test_alternate_reference() {
        let reading = map_frequency(432.0, 432.0).unwrap();
        assert_eq!(reading.note, "A");
        assert_eq!(reading.cents, 0);
    }

    #[test]
    fn test_invalid_frequency() {
        assert!(map_frequency(0.0, 440.0).is_none());
        assert!(map_frequency(-5.0, 440.0).is_none());
        assert!(map_frequency(f32::NAN, 440.0).is_none());
    }
}
