use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::GcdError;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct VoltageWindow {
    pub v_start: f64,
    pub v_end: f64,
}

impl VoltageWindow {
    pub fn width(&self) -> f64 {
        self.v_end - self.v_start
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub enum OutputMode {
    /// Specific capacitance (F/g), scaled by the cell factor `K`.
    Csp { k_factor: f64 },
    /// Specific capacity (mAh/g).
    Qsp,
}

/// Raw parameter record as supplied by a caller (flags, JSON file, GUI row).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsParams {
    pub v_start: f64,
    pub v_end: f64,
    pub output_type: String,
    pub k_factor: Option<f64>,
    pub n_gcd: i64,
    pub m_pos_mg: f64,
    pub m_neg_mg: f64,
    pub p_active_pct: f64,
    pub area_cm2: f64,
}

impl Default for MetricsParams {
    fn default() -> Self {
        Self {
            v_start: 0.0,
            v_end: 1.0,
            output_type: "Csp".to_string(),
            k_factor: Some(1.0),
            n_gcd: 1,
            m_pos_mg: 0.0,
            m_neg_mg: 0.0,
            p_active_pct: 100.0,
            area_cm2: 1.0,
        }
    }
}

impl MetricsParams {
    /// Validates the record once and freezes it into a [`MetricsConfig`].
    pub fn validate(&self) -> Result<MetricsConfig, GcdError> {
        let invalid = |msg: &str| Err(GcdError::InvalidParameter(msg.to_string()));

        if !(self.v_start.is_finite() && self.v_end.is_finite()) || self.v_start >= self.v_end {
            return invalid("V_start must be < V_end");
        }
        if self.n_gcd <= 0 {
            return invalid("N_GCD must be a positive integer");
        }
        if !(self.area_cm2 > 0.0) {
            return invalid("A_geom must be > 0");
        }
        let output = match self.output_type.trim() {
            "Csp" => match self.k_factor {
                Some(k) if k > 0.0 && k.is_finite() => OutputMode::Csp { k_factor: k },
                _ => return invalid("K is required and must be > 0 in Csp mode"),
            },
            "Qsp" => {
                if self.k_factor.is_some() {
                    return invalid("K must not be given in Qsp mode");
                }
                OutputMode::Qsp
            }
            other => {
                return Err(GcdError::InvalidParameter(format!(
                    "output_type must be Csp or Qsp, got '{}'",
                    other
                )))
            }
        };
        let m_active_g = active_mass_g(self.m_pos_mg, self.m_neg_mg, self.p_active_pct)?;

        Ok(MetricsConfig {
            window: VoltageWindow {
                v_start: self.v_start,
                v_end: self.v_end,
            },
            output,
            n_gcd: self.n_gcd,
            m_active_g,
            area_cm2: self.area_cm2,
        })
    }

    pub fn params_hash_sha256(&self) -> Result<String, GcdError> {
        let bytes =
            serde_json::to_vec(self).map_err(|e| GcdError::InvalidParameter(e.to_string()))?;
        let digest = Sha256::digest(&bytes);
        let mut out = String::with_capacity(digest.len() * 2);
        for b in digest {
            use std::fmt::Write;
            let _ = write!(&mut out, "{:02x}", b);
        }
        Ok(out)
    }
}

/// Active mass in grams from electrode masses (mg) and the active fraction (%).
pub fn active_mass_g(m_pos_mg: f64, m_neg_mg: f64, p_active_pct: f64) -> Result<f64, GcdError> {
    if !(m_pos_mg >= 0.0) {
        return Err(GcdError::InvalidParameter("m_pos must be >= 0".into()));
    }
    if !(m_neg_mg >= 0.0) {
        return Err(GcdError::InvalidParameter("m_neg must be >= 0".into()));
    }
    if m_pos_mg + m_neg_mg <= 0.0 {
        return Err(GcdError::InvalidParameter("m_pos + m_neg must be > 0".into()));
    }
    if !(p_active_pct > 0.0 && p_active_pct <= 100.0) {
        return Err(GcdError::InvalidParameter(
            "p_active must satisfy 0 < p_active <= 100".into(),
        ));
    }
    Ok((m_pos_mg + m_neg_mg) * p_active_pct / 100.0 / 1000.0)
}

/// Immutable, validated configuration for one metrics run.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct MetricsConfig {
    pub window: VoltageWindow,
    pub output: OutputMode,
    /// Representative cycle number.
    pub n_gcd: i64,
    pub m_active_g: f64,
    pub area_cm2: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> MetricsParams {
        MetricsParams {
            v_start: 0.0,
            v_end: 0.8,
            m_pos_mg: 2.0,
            m_neg_mg: 2.0,
            p_active_pct: 80.0,
            ..MetricsParams::default()
        }
    }

    #[test]
    fn active_mass_combines_both_electrodes() {
        let m = active_mass_g(2.0, 3.0, 50.0).unwrap();
        assert!((m - 0.0025).abs() < 1e-12);
    }

    #[test]
    fn active_mass_rejects_empty_basis() {
        assert!(active_mass_g(0.0, 0.0, 50.0).is_err());
        assert!(active_mass_g(1.0, 0.0, 0.0).is_err());
        assert!(active_mass_g(1.0, 0.0, 120.0).is_err());
        assert!(active_mass_g(-1.0, 2.0, 50.0).is_err());
    }

    #[test]
    fn csp_requires_positive_k() {
        let mut p = params();
        p.k_factor = None;
        assert!(p.validate().is_err());
        p.k_factor = Some(0.0);
        assert!(p.validate().is_err());
        p.k_factor = Some(4.0);
        let cfg = p.validate().unwrap();
        assert_eq!(cfg.output, OutputMode::Csp { k_factor: 4.0 });
        assert!((cfg.m_active_g - 0.0032).abs() < 1e-12);
    }

    #[test]
    fn qsp_rejects_k() {
        let mut p = params();
        p.output_type = "Qsp".into();
        assert!(p.validate().is_err());
        p.k_factor = None;
        assert_eq!(p.validate().unwrap().output, OutputMode::Qsp);
    }

    #[test]
    fn window_must_be_ordered() {
        let mut p = params();
        p.v_start = 1.0;
        p.v_end = 1.0;
        assert!(p.validate().is_err());
    }

    #[test]
    fn params_hash_is_stable_and_sensitive() {
        let p = params();
        let a = p.params_hash_sha256().unwrap();
        assert_eq!(a, p.params_hash_sha256().unwrap());
        assert_eq!(a.len(), 64);
        let mut q = params();
        q.v_end = 0.9;
        assert_ne!(a, q.params_hash_sha256().unwrap());
    }
}
