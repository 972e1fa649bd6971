//! Band model: a single filter stage and the ordered collection of stages
//! that makes up an EQ curve.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Center frequencies of the ten-band layout, also used as chart gridlines.
pub const STANDARD_FREQUENCIES: [f64; 10] = [
    32.0, 64.0, 125.0, 250.0, 500.0, 1000.0, 2000.0, 4000.0, 8000.0, 16000.0,
];

pub const MIN_GAIN_DB: f64 = -12.0;
pub const MAX_GAIN_DB: f64 = 12.0;
/// Slider resolution for user edits
pub const GAIN_STEP_DB: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterKind {
    Lowpass,
    Highpass,
    Bandpass,
    Lowshelf,
    Highshelf,
    Peaking,
    Notch,
    Allpass,
}

/// One parametric filter stage.
///
/// Frequencies outside 20 Hz..20 kHz are accepted; the chart simply clips them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Band {
    pub frequency: f64,
    pub gain: f64,
    pub q: f64,
    #[serde(rename = "type")]
    pub kind: FilterKind,
}

impl Band {
    pub const fn new(frequency: f64, gain: f64, q: f64, kind: FilterKind) -> Self {
        Self {
            frequency,
            gain,
            q,
            kind,
        }
    }

    /// Short label used by the sliders: `500Hz`, `2kHz`.
    pub fn label(&self) -> String {
        if self.frequency >= 1000.0 {
            format!("{}kHz", self.frequency / 1000.0)
        } else {
            format!("{}Hz", self.frequency)
        }
    }
}

/// Snap a requested gain onto the slider grid and into the allowed range.
pub fn quantize_gain(gain_db: f64) -> f64 {
    let snapped = (gain_db / GAIN_STEP_DB).round() * GAIN_STEP_DB;
    snapped.clamp(MIN_GAIN_DB, MAX_GAIN_DB)
}

/// Ordered bands. Order only matters for chaining filters during playback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BandCollection(Vec<Band>);

impl BandCollection {
    pub fn new(bands: Vec<Band>) -> Self {
        Self(bands)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Band> {
        self.0.iter()
    }

    pub fn get(&self, index: usize) -> Option<&Band> {
        self.0.get(index)
    }

    /// Set the gain of one band, clamped to ±12 dB in 0.5 dB steps.
    /// Returns the value actually stored.
    pub fn set_gain(&mut self, index: usize, gain_db: f64) -> Result<f64> {
        if !gain_db.is_finite() {
            return Err(Error::Validation(format!("invalid gain: {gain_db}")));
        }
        let len = self.len();
        let band = self
            .0
            .get_mut(index)
            .ok_or_else(|| Error::Validation(format!("band {index} out of range (0..{len})")))?;
        band.gain = quantize_gain(gain_db);
        Ok(band.gain)
    }
}

/// Flat ten-band layout: low shelf, eight peaking bands, high shelf.
impl Default for BandCollection {
    fn default() -> Self {
        let last = STANDARD_FREQUENCIES.len() - 1;
        STANDARD_FREQUENCIES
            .iter()
            .enumerate()
            .map(|(i, &frequency)| {
                let kind = match i {
                    0 => FilterKind::Lowshelf,
                    i if i == last => FilterKind::Highshelf,
                    _ => FilterKind::Peaking,
                };
                Band::new(frequency, 0.0, 1.0, kind)
            })
            .collect()
    }
}

impl FromIterator<Band> for BandCollection {
    fn from_iter<I: IntoIterator<Item = Band>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a BandCollection {
    type Item = &'a Band;
    type IntoIter = std::slice::Iter<'a, Band>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_layout_is_flat_ten_band() {
        let bands = BandCollection::default();
        assert_eq!(bands.len(), 10);
        assert_eq!(bands.get(0).unwrap().kind, FilterKind::Lowshelf);
        assert_eq!(bands.get(9).unwrap().kind, FilterKind::Highshelf);
        for (band, freq) in bands.iter().zip(STANDARD_FREQUENCIES) {
            assert_eq!(band.frequency, freq);
            assert_eq!(band.gain, 0.0);
            assert_eq!(band.q, 1.0);
        }
        assert!(bands.iter().skip(1).take(8).all(|b| b.kind == FilterKind::Peaking));
    }

    #[test]
    fn set_gain_clamps_to_range() {
        let mut bands = BandCollection::default();
        assert_eq!(bands.set_gain(0, 20.0).unwrap(), 12.0);
        assert_eq!(bands.set_gain(0, -50.0).unwrap(), -12.0);
        assert_eq!(bands.get(0).unwrap().gain, -12.0);
    }

    #[test]
    fn set_gain_snaps_to_half_db() {
        let mut bands = BandCollection::default();
        assert_eq!(bands.set_gain(3, 2.3).unwrap(), 2.5);
        assert_eq!(bands.set_gain(3, -1.2).unwrap(), -1.0);
        assert_eq!(bands.set_gain(3, 4.0).unwrap(), 4.0);
    }

    #[test]
    fn set_gain_rejects_bad_input() {
        let mut bands = BandCollection::default();
        assert!(matches!(bands.set_gain(10, 1.0), Err(Error::Validation(_))));
        assert!(matches!(bands.set_gain(0, f64::NAN), Err(Error::Validation(_))));
        assert_eq!(bands, BandCollection::default());
    }

    #[test]
    fn table_values_survive_json_unchanged() {
        for q in [0.7, 0.8, 1.2, 1.5] {
            let json = serde_json::to_string(&Band::new(64.0, -1.0, q, FilterKind::Peaking)).unwrap();
            assert!(json.contains(&format!("\"q\":{q}")), "{json}");
        }
    }

    #[test]
    fn band_json_uses_wire_field_names() {
        let band = Band::new(1000.0, 2.0, 1.2, FilterKind::Peaking);
        let json = serde_json::to_value(band).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "frequency": 1000.0, "gain": 2.0, "q": 1.2, "type": "peaking" })
        );

        let parsed: BandCollection = serde_json::from_str(
            r#"[{"frequency":32,"gain":4,"q":0.8,"type":"lowshelf"}]"#,
        )
        .unwrap();
        assert_eq!(parsed.get(0).unwrap().kind, FilterKind::Lowshelf);
        assert_eq!(parsed.get(0).unwrap().gain, 4.0);
    }

    #[test]
    fn labels_switch_to_khz() {
        assert_eq!(Band::new(500.0, 0.0, 1.0, FilterKind::Peaking).label(), "500Hz");
        assert_eq!(Band::new(2000.0, 0.0, 1.0, FilterKind::Peaking).label(), "2kHz");
    }
}
