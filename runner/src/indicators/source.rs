//! Derived price series selectable by indicator calls (spec.md §4.6).

use crate::market::Series;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Close,
    Open,
    High,
    Low,
    Volume,
    /// `(H+L)/2`
    Hl2,
    /// `(H+L+C)/3`, aka "Typical Price"
    Hlc3,
    /// `(O+H+L+C)/4`
    Ohlc4,
}

impl Source {
    /// Unknown source names default to `Close` (spec.md §4.6).
    pub fn parse(name: &str) -> Source {
        match name {
            "Close" => Source::Close,
            "Open" => Source::Open,
            "High" => Source::High,
            "Low" => Source::Low,
            "Volume" => Source::Volume,
            "HL2" => Source::Hl2,
            "HLC3" | "Typical Price" => Source::Hlc3,
            "OHLC4" => Source::Ohlc4,
            _ => Source::Close,
        }
    }

    pub fn canonical(&self) -> &'static str {
        match self {
            Source::Close => "Close",
            Source::Open => "Open",
            Source::High => "High",
            Source::Low => "Low",
            Source::Volume => "Volume",
            Source::Hl2 => "HL2",
            Source::Hlc3 => "HLC3",
            Source::Ohlc4 => "OHLC4",
        }
    }

    /// Derive this source's values from a series. Allocates a fresh `Vec`
    /// for the composite sources; returns the backing slice verbatim
    /// (cloned) for the single-field ones.
    pub fn derive(&self, series: &Series) -> Vec<f64> {
        match self {
            Source::Close => series.closes.clone(),
            Source::Open => series.opens.clone(),
            Source::High => series.highs.clone(),
            Source::Low => series.lows.clone(),
            Source::Volume => series.volumes.clone(),
            Source::Hl2 => zip2(&series.highs, &series.lows, |h, l| (h + l) / 2.0),
            Source::Hlc3 => zip3(&series.highs, &series.lows, &series.closes, |h, l, c| {
                (h + l + c) / 3.0
            }),
            Source::Ohlc4 => zip4(
                &series.opens,
                &series.highs,
                &series.lows,
                &series.closes,
                |o, h, l, c| (o + h + l + c) / 4.0,
            ),
        }
    }
}

fn zip2(a: &[f64], b: &[f64], f: impl Fn(f64, f64) -> f64) -> Vec<f64> {
    a.iter().zip(b.iter()).map(|(&x, &y)| f(x, y)).collect()
}

fn zip3(a: &[f64], b: &[f64], c: &[f64], f: impl Fn(f64, f64, f64) -> f64) -> Vec<f64> {
    a.iter()
        .zip(b.iter())
        .zip(c.iter())
        .map(|((&x, &y), &z)| f(x, y, z))
        .collect()
}

fn zip4(
    a: &[f64],
    b: &[f64],
    c: &[f64],
    d: &[f64],
    f: impl Fn(f64, f64, f64, f64) -> f64,
) -> Vec<f64> {
    a.iter()
        .zip(b.iter())
        .zip(c.iter())
        .zip(d.iter())
        .map(|(((&w, &x), &y), &z)| f(w, x, y, z))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_source_defaults_to_close() {
        assert_eq!(Source::parse("Nonsense"), Source::Close);
    }

    #[test]
    fn typical_price_alias() {
        assert_eq!(Source::parse("Typical Price"), Source::Hlc3);
    }
}
