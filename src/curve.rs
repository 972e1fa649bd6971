//! EQ curve synthesis and chart rendering.
//!
//! The default curve is a visual approximation: each band contributes a
//! simple shape (triangular falloff in octave space for peaking bands,
//! linear rolloff for shelves) and the contributions are summed. It is not
//! a cascaded biquad transfer function. [`measured_response`] gives the
//! exact response of the real filter chain when that matters.
//!
//! Axes: x is log-frequency from 20 Hz to 20 kHz, y is linear dB with a
//! ±12 dB display range.

use rustfft::{FftPlanner, num_complex::Complex};
use serde::{Deserialize, Serialize};

use crate::bands::{Band, BandCollection, FilterKind, MAX_GAIN_DB, STANDARD_FREQUENCIES};
use crate::error::Result;
use crate::graph::FilterNode;

pub const MIN_FREQUENCY: f64 = 20.0;
pub const MAX_FREQUENCY: f64 = 20_000.0;
/// Ratio between consecutive sample frequencies
pub const FREQUENCY_STEP: f64 = 1.1;
/// Gridline spacing on the dB axis
const GRID_DB_STEP: i32 = 3;
const LABEL_DB_STEP: i32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CurvePoint {
    pub frequency: f64,
    pub gain_db: f64,
}

/// How the chart computes its curve.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CurveMode {
    /// Summed per-band shapes
    #[default]
    Approx,
    /// Impulse response of the real biquad chain
    Measured,
}

/// One band's share of the total gain at `frequency`.
pub fn band_contribution(band: &Band, frequency: f64) -> f64 {
    match band.kind {
        FilterKind::Peaking => {
            let bandwidth = band.frequency / band.q;
            let distance = (frequency / band.frequency).log2().abs();
            let max_distance = (bandwidth / band.frequency + 1.0).log2();
            if distance <= max_distance {
                band.gain * (1.0 - distance / max_distance)
            } else {
                0.0
            }
        }
        FilterKind::Lowshelf => {
            if frequency <= band.frequency {
                band.gain
            } else {
                let rolloff = (1.0 - (frequency - band.frequency) / band.frequency).max(0.0);
                band.gain * rolloff
            }
        }
        FilterKind::Highshelf => {
            if frequency >= band.frequency {
                band.gain
            } else {
                let rolloff = (1.0 - (band.frequency - frequency) / band.frequency).max(0.0);
                band.gain * rolloff
            }
        }
        // Not drawn
        FilterKind::Lowpass
        | FilterKind::Highpass
        | FilterKind::Bandpass
        | FilterKind::Notch
        | FilterKind::Allpass => 0.0,
    }
}

/// Geometric frequency grid: 20 Hz, 22 Hz, 24.2 Hz, ... up to 20 kHz.
pub fn sample_frequencies() -> impl Iterator<Item = f64> {
    std::iter::successors(Some(MIN_FREQUENCY), |f| Some(f * FREQUENCY_STEP))
        .take_while(|f| *f <= MAX_FREQUENCY)
}

/// Lazily sums band contributions across the spectrum.
#[derive(Debug, Clone, Copy)]
pub struct CurveSynthesizer<'a> {
    bands: &'a BandCollection,
}

impl<'a> CurveSynthesizer<'a> {
    pub fn new(bands: &'a BandCollection) -> Self {
        Self { bands }
    }

    pub fn gain_at(&self, frequency: f64) -> f64 {
        self.bands
            .iter()
            .map(|band| band_contribution(band, frequency))
            .sum()
    }

    pub fn samples(self) -> impl Iterator<Item = CurvePoint> + 'a {
        sample_frequencies().map(move |frequency| CurvePoint {
            frequency,
            gain_db: self.gain_at(frequency),
        })
    }
}

/// Magnitude response of the real filter chain on the same frequency grid.
///
/// A unit impulse is run through freshly built biquads and the impulse
/// response is taken through an FFT. Grid frequencies at or above Nyquist
/// are skipped. `fft_size` trades bass resolution for work; 8192 resolves
/// the 32 Hz band well at 48 kHz.
pub fn measured_response(
    bands: &BandCollection,
    sample_rate: f64,
    fft_size: usize,
) -> Result<Vec<CurvePoint>> {
    let mut nodes = bands
        .iter()
        .map(|band| FilterNode::new(*band, sample_rate as f32))
        .collect::<Result<Vec<_>>>()?;

    let mut impulse = vec![0.0; fft_size];
    if let Some(first) = impulse.first_mut() {
        *first = 1.0;
    }

    let mut buffer: Vec<Complex<f32>> = impulse
        .iter()
        .map(|&x| {
            let y = nodes.iter_mut().fold(x, |acc, node| node.process(acc));
            Complex::new(y, 0.0)
        })
        .collect();

    let mut planner = FftPlanner::new();
    let fft = planner.plan_fft_forward(fft_size);
    fft.process(&mut buffer);

    let points = sample_frequencies()
        .filter_map(|frequency| {
            // bin = freq * total_bins / sample_rate
            let bin = (frequency * fft_size as f64 / sample_rate).round() as usize;
            if bin >= fft_size / 2 {
                return None;
            }
            let magnitude = f64::from(buffer[bin].norm());
            // Floor avoids log10(0)
            let gain_db = if magnitude > 1e-10 {
                20.0 * magnitude.log10()
            } else {
                -100.0
            };
            Some(CurvePoint { frequency, gain_db })
        })
        .collect();

    Ok(points)
}

/// Pixel geometry of the chart.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChartLayout {
    pub width: f64,
    pub height: f64,
    pub padding: f64,
}

impl Default for ChartLayout {
    fn default() -> Self {
        Self {
            width: 800.0,
            height: 256.0,
            padding: 40.0,
        }
    }
}

/// A horizontal dB gridline
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DbGridline {
    pub db: i32,
    pub y: f64,
    pub emphasized: bool,
}

impl ChartLayout {
    pub fn x_for(&self, frequency: f64) -> f64 {
        let span = MAX_FREQUENCY.log10() - MIN_FREQUENCY.log10();
        self.padding
            + (frequency.log10() - MIN_FREQUENCY.log10()) / span * (self.width - 2.0 * self.padding)
    }

    /// Gain beyond the display range is pinned to the edge.
    pub fn y_for(&self, gain_db: f64) -> f64 {
        let gain = gain_db.clamp(-MAX_GAIN_DB, MAX_GAIN_DB);
        self.height / 2.0 - (gain / MAX_GAIN_DB) * (self.height / 2.0 - self.padding)
    }

    /// Vertical gridlines at the ten standard band centers
    pub fn frequency_gridlines(&self) -> Vec<(f64, f64)> {
        STANDARD_FREQUENCIES
            .iter()
            .map(|&f| (f, self.x_for(f)))
            .collect()
    }

    /// Every 3 dB from -12 to +12, 0 dB emphasized
    pub fn db_gridlines(&self) -> Vec<DbGridline> {
        let max = MAX_GAIN_DB as i32;
        (-max..=max)
            .step_by(GRID_DB_STEP as usize)
            .map(|db| DbGridline {
                db,
                y: self.y_for(db as f64),
                emphasized: db == 0,
            })
            .collect()
    }
}

/// `32`, `500`, `1k`, `16k`
pub fn frequency_label(frequency: f64) -> String {
    if frequency >= 1000.0 {
        format!("{}k", frequency / 1000.0)
    } else {
        format!("{frequency}")
    }
}

/// `-12dB`, `0dB`, `+6dB`
pub fn db_label(db: i32) -> String {
    if db > 0 {
        format!("+{db}dB")
    } else {
        format!("{db}dB")
    }
}

/// Render the chart (grid, curve, labels) as a standalone SVG document.
pub fn render_svg(points: &[CurvePoint], layout: &ChartLayout) -> String {
    let ChartLayout {
        width,
        height,
        padding,
    } = *layout;
    let mut svg = vec![
        format!(
            r#"<svg xmlns="http://www.w3.org/2000/svg" class="eq-chart" width="{width}" height="{height}" viewBox="0 0 {width} {height}">"#
        ),
        format!(
            r#"<defs><clipPath id="eq-plot"><rect x="{padding}" y="{padding}" width="{}" height="{}"/></clipPath></defs>"#,
            width - 2.0 * padding,
            height - 2.0 * padding
        ),
        r#"<g class="grid" stroke="rgba(128,128,128,0.2)" stroke-width="1">"#.to_string(),
    ];

    for (_, x) in layout.frequency_gridlines() {
        svg.push(format!(
            r#"<line x1="{x:.2}" y1="{padding}" x2="{x:.2}" y2="{}"/>"#,
            height - padding
        ));
    }
    let db_lines = layout.db_gridlines();
    for line in db_lines.iter().filter(|l| !l.emphasized) {
        svg.push(format!(
            r#"<line data-db="{}" x1="{padding}" y1="{y:.2}" x2="{}" y2="{y:.2}"/>"#,
            line.db,
            width - padding,
            y = line.y
        ));
    }
    svg.push("</g>".to_string());

    for line in db_lines.iter().filter(|l| l.emphasized) {
        svg.push(format!(
            r#"<line class="zero" x1="{padding}" y1="{y:.2}" x2="{}" y2="{y:.2}" stroke="rgba(128,128,128,0.5)" stroke-width="2"/>"#,
            width - padding,
            y = line.y
        ));
    }

    let polyline: Vec<String> = points
        .iter()
        .map(|p| format!("{:.2},{:.2}", layout.x_for(p.frequency), layout.y_for(p.gain_db)))
        .collect();
    svg.push(format!(
        r##"<polyline class="curve" fill="none" stroke="#3b82f6" stroke-width="3" clip-path="url(#eq-plot)" points="{}"/>"##,
        polyline.join(" ")
    ));

    svg.push(
        r#"<g class="labels" fill="rgba(128,128,128,0.8)" font-size="12" font-family="sans-serif">"#
            .to_string(),
    );
    for (frequency, x) in layout.frequency_gridlines() {
        svg.push(format!(
            r#"<text x="{x:.2}" y="{}" text-anchor="middle">{}</text>"#,
            height - 10.0,
            frequency_label(frequency)
        ));
    }
    let max = MAX_GAIN_DB as i32;
    for db in (-max..=max).step_by(LABEL_DB_STEP as usize) {
        svg.push(format!(
            r#"<text x="{}" y="{:.2}" text-anchor="end">{}</text>"#,
            padding - 10.0,
            layout.y_for(db as f64) + 4.0,
            db_label(db)
        ));
    }
    svg.push("</g>".to_string());
    svg.push("</svg>".to_string());

    svg.join("\n")
}

/// Curve points for `bands` in the requested mode.
pub fn curve_points(
    bands: &BandCollection,
    mode: CurveMode,
    sample_rate: f64,
) -> Result<Vec<CurvePoint>> {
    match mode {
        CurveMode::Approx => Ok(CurveSynthesizer::new(bands).samples().collect()),
        CurveMode::Measured => measured_response(bands, sample_rate, 8192),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::Genre;

    fn single(band: Band) -> BandCollection {
        BandCollection::new(vec![band])
    }

    #[test]
    fn one_sample_per_geometric_step() {
        let bands = BandCollection::default();
        let points: Vec<_> = CurveSynthesizer::new(&bands).samples().collect();
        // 20 * 1.1^72 ≈ 19112 Hz is the last step below 20 kHz
        assert_eq!(points.len(), 73);
        assert_eq!(points[0].frequency, 20.0);
        for pair in points.windows(2) {
            assert!((pair[1].frequency / pair[0].frequency - 1.1).abs() < 1e-4);
        }
        assert!(points.last().unwrap().frequency <= MAX_FREQUENCY);
    }

    #[test]
    fn flat_bands_give_flat_curve() {
        let bands = BandCollection::default();
        assert!(CurveSynthesizer::new(&bands).samples().all(|p| p.gain_db == 0.0));
    }

    #[test]
    fn peaking_has_triangular_falloff() {
        let band = Band::new(1000.0, 6.0, 1.0, FilterKind::Peaking);
        // q = 1: reaches zero one octave away
        assert_eq!(band_contribution(&band, 1000.0), 6.0);
        assert!((band_contribution(&band, 2f64.sqrt() * 1000.0) - 3.0).abs() < 1e-4);
        assert!((band_contribution(&band, 1000.0 / 2f64.sqrt()) - 3.0).abs() < 1e-4);
        assert_eq!(band_contribution(&band, 2100.0), 0.0);
        assert_eq!(band_contribution(&band, 400.0), 0.0);
    }

    #[test]
    fn peaking_is_zero_beyond_max_distance() {
        let band = Band::new(500.0, -9.0, 2.0, FilterKind::Peaking);
        let max_distance = (1.0f64 / 2.0 + 1.0).log2();
        for f in sample_frequencies() {
            let distance = (f / 500.0).log2().abs();
            let c = band_contribution(&band, f);
            if distance > max_distance {
                assert_eq!(c, 0.0, "at {f} Hz");
            } else {
                assert!(c <= 0.0 && c >= -9.0);
            }
        }
    }

    #[test]
    fn shelves_hold_full_gain_on_their_side() {
        let low = Band::new(100.0, 4.0, 1.0, FilterKind::Lowshelf);
        assert_eq!(band_contribution(&low, 20.0), 4.0);
        assert_eq!(band_contribution(&low, 150.0), 2.0);
        assert_eq!(band_contribution(&low, 250.0), 0.0);

        let high = Band::new(8000.0, -4.0, 1.0, FilterKind::Highshelf);
        assert_eq!(band_contribution(&high, 16000.0), -4.0);
        assert_eq!(band_contribution(&high, 6000.0), -3.0);
        assert_eq!(band_contribution(&high, 4000.0), -2.0);
    }

    #[test]
    fn other_kinds_are_not_drawn() {
        for kind in [
            FilterKind::Lowpass,
            FilterKind::Highpass,
            FilterKind::Bandpass,
            FilterKind::Notch,
            FilterKind::Allpass,
        ] {
            let band = Band::new(1000.0, 12.0, 1.0, kind);
            assert_eq!(band_contribution(&band, 1000.0), 0.0);
        }
    }

    #[test]
    fn single_band_curve_is_bounded_by_its_gain() {
        for band in [
            Band::new(1000.0, 12.0, 0.5, FilterKind::Peaking),
            Band::new(64.0, -12.0, 1.0, FilterKind::Lowshelf),
            Band::new(8000.0, 7.5, 1.0, FilterKind::Highshelf),
        ] {
            let bands = single(band);
            let peak = band.gain.abs();
            assert!(
                CurveSynthesizer::new(&bands)
                    .samples()
                    .all(|p| p.gain_db.abs() <= peak + 1e-4)
            );
        }
    }

    #[test]
    fn summed_curve_is_bounded_by_total_gain() {
        let bands = Genre::HipHopRap.bands();
        let total: f64 = bands.iter().map(|b| b.gain.abs()).sum();
        assert!(
            CurveSynthesizer::new(&bands)
                .samples()
                .all(|p| p.gain_db.abs() <= total)
        );
    }

    #[test]
    fn axis_mapping_hits_plot_edges() {
        let layout = ChartLayout {
            width: 840.0,
            height: 280.0,
            padding: 40.0,
        };
        assert!((layout.x_for(20.0) - 40.0).abs() < 1e-3);
        assert!((layout.x_for(20_000.0) - 800.0).abs() < 1e-3);
        // 632 Hz sits at the geometric middle
        assert!((layout.x_for(20.0 * 1000f64.sqrt()) - 420.0).abs() < 1e-2);

        assert_eq!(layout.y_for(0.0), 140.0);
        assert_eq!(layout.y_for(12.0), 40.0);
        assert_eq!(layout.y_for(-12.0), 240.0);
        assert_eq!(layout.y_for(30.0), 40.0);
    }

    #[test]
    fn gridlines_cover_bands_and_db_steps() {
        let layout = ChartLayout::default();
        assert_eq!(layout.frequency_gridlines().len(), 10);
        let db: Vec<_> = layout.db_gridlines().iter().map(|l| l.db).collect();
        assert_eq!(db, vec![-12, -9, -6, -3, 0, 3, 6, 9, 12]);
        let emphasized: Vec<_> = layout
            .db_gridlines()
            .into_iter()
            .filter(|l| l.emphasized)
            .collect();
        assert_eq!(emphasized.len(), 1);
        assert_eq!(emphasized[0].y, layout.height / 2.0);
    }

    #[test]
    fn labels() {
        assert_eq!(frequency_label(32.0), "32");
        assert_eq!(frequency_label(1000.0), "1k");
        assert_eq!(frequency_label(16000.0), "16k");
        assert_eq!(db_label(-12), "-12dB");
        assert_eq!(db_label(0), "0dB");
        assert_eq!(db_label(6), "+6dB");
    }

    #[test]
    fn svg_contains_curve_grid_and_labels() {
        let bands = Genre::RockMetal.bands();
        let points: Vec<_> = CurveSynthesizer::new(&bands).samples().collect();
        let svg = render_svg(&points, &ChartLayout::default());
        assert!(svg.starts_with("<svg"));
        assert!(svg.ends_with("</svg>"));
        assert!(svg.contains(r#"class="curve""#));
        assert!(svg.contains(r#"class="zero""#));
        assert!(svg.contains(">16k</text>"));
        assert!(svg.contains(">+12dB</text>"));
        // 10 frequency + 8 non-zero dB gridlines + zero line
        assert_eq!(svg.matches("<line").count(), 19);
    }

    #[test]
    fn measured_response_matches_band_gain_at_center() {
        let bands = single(Band::new(1000.0, 6.0, 1.0, FilterKind::Peaking));
        let points = measured_response(&bands, 48_000.0, 8192).unwrap();
        assert_eq!(points.len(), 73);

        // 20 * 1.1^41 ≈ 996 Hz
        let center = points
            .iter()
            .min_by(|a, b| {
                (a.frequency - 1000.0)
                    .abs()
                    .total_cmp(&(b.frequency - 1000.0).abs())
            })
            .unwrap();
        assert!((center.gain_db - 6.0).abs() < 0.3, "{center:?}");
        assert!(points[0].gain_db.abs() < 0.5);
    }

    #[test]
    fn measured_response_skips_above_nyquist() {
        let bands = BandCollection::new(vec![]);
        let points = measured_response(&bands, 16_000.0, 4096).unwrap();
        assert!(points.iter().all(|p| p.frequency < 8000.0));
        assert!(points.iter().all(|p| p.gain_db.abs() < 1e-3));
    }
}
