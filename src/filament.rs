//! Length-to-weight conversion for filament.

use std::f64::consts::PI;

use crate::config::TrackingConfig;
use crate::slot::FALLBACK_MATERIAL;

/// Density used when neither the material nor `OTHER` has a configured value.
const DEFAULT_DENSITY_G_CM3: f64 = 1.20;

impl TrackingConfig {
    /// Density for a material, falling back to the `OTHER` entry.
    pub fn density_for(&self, material: &str) -> f64 {
        self.densities
            .get(&material.trim().to_uppercase())
            .or_else(|| self.densities.get(FALLBACK_MATERIAL))
            .copied()
            .unwrap_or(DEFAULT_DENSITY_G_CM3)
    }

    /// Weight in grams of `mm` of filament of the given material.
    pub fn mm_to_g(&self, material: &str, mm: f64) -> f64 {
        mm_to_g(self.density_for(material), self.filament_diameter_mm, mm)
    }
}

/// grams = density (g/cm³) × cross section (cm²) × length (cm). Never negative.
pub fn mm_to_g(density_g_cm3: f64, diameter_mm: f64, mm: f64) -> f64 {
    let area_cm2 = PI * (diameter_mm / 2.0).powi(2) / 100.0;
    let length_cm = mm / 10.0;
    (density_g_cm3 * area_cm2 * length_cm).max(0.0)
}
