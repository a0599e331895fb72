//! Peak and linewidth extraction.

/// Planck constant times speed of light, in eV·nm.
pub const HC_EV_NM: f64 = 1239.841_93;

/// Photon energy in eV of a wavelength in nm.
pub fn wavelength_to_energy(wavelength_nm: f64) -> f64 {
    HC_EV_NM / wavelength_nm
}

/// Convert a linewidth measured in wavelength to energy at the given peak position.
///
/// Uses the Jacobian `|dE/dλ| = hc / λ²`, so the conversion depends on where the peak sits.
pub fn fwhm_wavelength_to_energy(fwhm_nm: f64, peak_nm: f64) -> f64 {
    HC_EV_NM / (peak_nm * peak_nm) * fwhm_nm
}

/// Inverse of [`fwhm_wavelength_to_energy`].
pub fn fwhm_energy_to_wavelength(fwhm_ev: f64, peak_nm: f64) -> f64 {
    fwhm_ev * peak_nm * peak_nm / HC_EV_NM
}

/// Peak position and width in the wavelength domain.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Peak {
    /// Grid index of the maximum.
    pub index: usize,
    /// Wavelength of the maximum.
    pub wavelength_nm: f64,
    /// Smoothed intensity at the maximum.
    pub intensity: f64,
    /// `None` when the profile does not fall below half maximum on both sides.
    pub fwhm_nm: Option<f64>,
}

/// Locate the maximum of `intensities` and measure its full width at half maximum.
///
/// Half-maximum crossings are linearly interpolated between samples. Returns `None` for
/// empty or mismatched input.
pub fn find_peak(wavelengths: &[f64], intensities: &[f64]) -> Option<Peak> {
    if wavelengths.is_empty() || wavelengths.len() != intensities.len() {
        return None;
    }

    let (index, &intensity) = intensities
        .iter()
        .enumerate()
        .filter(|(_, v)| v.is_finite())
        .max_by(|a, b| a.1.total_cmp(b.1))?;

    let half = intensity / 2.0;

    let left = (0..index)
        .rev()
        .find(|&i| intensities[i] < half)
        .map(|i| crossing(wavelengths, intensities, i, i + 1, half));
    let right = (index + 1..intensities.len())
        .find(|&i| intensities[i] < half)
        .map(|i| crossing(wavelengths, intensities, i - 1, i, half));

    let fwhm_nm = match (left, right) {
        (Some(l), Some(r)) if intensity > 0.0 => Some(r - l),
        _ => None,
    };

    Some(Peak {
        index,
        wavelength_nm: wavelengths[index],
        intensity,
        fwhm_nm,
    })
}

fn crossing(xs: &[f64], ys: &[f64], a: usize, b: usize, level: f64) -> f64 {
    let (ya, yb) = (ys[a], ys[b]);
    if (yb - ya).abs() < f64::EPSILON {
        return xs[a];
    }
    xs[a] + (level - ya) * (xs[b] - xs[a]) / (yb - ya)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gaussian(axis: &[f64], center: f64, fwhm: f64, amplitude: f64) -> Vec<f64> {
        let sigma = fwhm / (2.0 * (2.0 * std::f64::consts::LN_2).sqrt());
        axis.iter()
            .map(|x| amplitude * (-(x - center).powi(2) / (2.0 * sigma * sigma)).exp())
            .collect()
    }

    #[test]
    fn test_energy_conversion() {
        assert!((wavelength_to_energy(620.0) - 1.999_745).abs() < 1e-5);
        // 10 nm at 500 nm is about 49.6 meV.
        let ev = fwhm_wavelength_to_energy(10.0, 500.0);
        assert!((ev - 0.049_593_677).abs() < 1e-8);
    }

    #[test]
    fn test_gaussian_peak_and_width() {
        let axis: Vec<f64> = (0..=700).map(|i| 400.0 + i as f64).collect();
        let ys = gaussian(&axis, 650.0, 40.0, 1000.0);
        let peak = find_peak(&axis, &ys).unwrap();
        assert_eq!(peak.wavelength_nm, 650.0);
        assert!((peak.intensity - 1000.0).abs() < 1e-9);
        let fwhm = peak.fwhm_nm.unwrap();
        assert!((fwhm - 40.0).abs() < 0.1, "fwhm {fwhm}");
    }

    #[test]
    fn test_truncated_peak_has_no_width() {
        let axis: Vec<f64> = (0..100).map(|i| 400.0 + i as f64).collect();
        // Maximum at the left edge: no crossing on that side.
        let ys = gaussian(&axis, 400.0, 30.0, 500.0);
        let peak = find_peak(&axis, &ys).unwrap();
        assert_eq!(peak.index, 0);
        assert_eq!(peak.fwhm_nm, None);
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(find_peak(&[], &[]), None);
        assert_eq!(find_peak(&[1.0], &[]), None);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn fwhm_conversion_round_trips(
            fwhm_nm in 0.01_f64..200.0,
            peak_nm in 200.0_f64..2000.0,
        ) {
            let ev = fwhm_wavelength_to_energy(fwhm_nm, peak_nm);
            let back = fwhm_energy_to_wavelength(ev, peak_nm);
            prop_assert!((back - fwhm_nm).abs() <= 1e-9 * fwhm_nm.max(1.0));
        }

        #[test]
        fn wider_in_wavelength_is_wider_in_energy(
            a in 0.01_f64..100.0,
            extra in 0.01_f64..100.0,
            peak_nm in 300.0_f64..1200.0,
        ) {
            prop_assert!(
                fwhm_wavelength_to_energy(a + extra, peak_nm) > fwhm_wavelength_to_energy(a, peak_nm)
            );
        }
    }
}
