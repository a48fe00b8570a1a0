//! Second-order resonant bandpass filters with power tracking
//!
//! Each detector band is a two-pole resonator driven by the differentiated
//! sample stream. The coefficient tables were produced by an external
//! filter-design tool at the exact center frequencies; the detectors depend
//! on these values bit-identically, so they are carried as constants and
//! never regenerated.

/// How much of the old value an averaging step keeps
pub const MOVING_AVG_KEEP: f64 = 0.97;

/// Two-pole filter parameters
#[derive(Debug, Clone, Copy)]
pub struct FilterParams {
    pub gain: f64,
    pub y0: f64,
    pub y1: f64,
}

// generated CNG detector (1100Hz) - either of the 2 below:
// mkfilter -Bp -Re 50 -a 0.137500
//  -> 2-pole resonator bandpass, 1100Hz, Q-factor=50
// mkfilter -Bu -Bp -o 1 -a 1.3612500000e-01 1.3887500000e-01
//  -> 2-pole butterworth bandpass, 1100Hz +-11Hz @ -3dB
pub const PARAMS_CNG: FilterParams = FilterParams {
    gain: 1.167453752e+02,
    y0: -0.9828688170,
    y1: 1.2878183436,
}; // 1100Hz

// generated CED detector (2100Hz) filter parameters
// mkfilter -Bu -Bp -o 1 -a 2.6062500000e-01 2.6437500000e-01
//  -> 2-pole butterworth bandpass, 2100Hz +-15Hz @ -3dB
pub const PARAMS_CED: FilterParams = FilterParams {
    gain: 8.587870006e+01,
    y0: -0.9767113407,
    y1: -0.1551017476,
}; // 2100Hz

// generated continuity test verified detector (2010Hz) filter parameters
// mkfilter -Bu -Bp -o 1 -a 2.5025000000e-01 2.5225000000e-01
//  -> 2-pole butterworth bandpass, 2010Hz +-8Hz @ -3dB
pub const PARAMS_COT_V: FilterParams = FilterParams {
    gain: 1.601528486e+02,
    y0: -0.9875119299,
    y1: -0.0156100298,
}; // 2010Hz

// generated continuity test send detector (1780Hz) filter parameters
// mkfilter -Bu -Bp -o 1 -a 2.1875000000e-01 2.2625000000e-01
//  -> 2-pole butterworth bandpass, 1780Hz +-30Hz @ -3dB
pub const PARAMS_COT_S: FilterParams = FilterParams {
    gain: 4.343337207e+01,
    y0: -0.9539525559,
    y1: 0.3360345780,
}; // 1780Hz

// generated DTMF component filter parameters
// 2-pole butterworth bandpass, +-1% @ -3dB
pub const PARAMS_DTMF_LOW: [FilterParams; 4] = [
    FilterParams { gain: 1.836705768e+02, y0: -0.9891110494, y1: 1.6984655220 }, // 697Hz
    FilterParams { gain: 1.663521771e+02, y0: -0.9879774290, y1: 1.6354206881 }, // 770Hz
    FilterParams { gain: 1.504376844e+02, y0: -0.9867055777, y1: 1.5582944783 }, // 852Hz
    FilterParams { gain: 1.363034877e+02, y0: -0.9853269818, y1: 1.4673997821 }, // 941Hz
];
pub const PARAMS_DTMF_HIGH: [FilterParams; 4] = [
    FilterParams { gain: 1.063096655e+02, y0: -0.9811871438, y1: 1.1532059506 }, // 1209Hz
    FilterParams { gain: 9.629842594e+01, y0: -0.9792313229, y1: 0.9860778489 }, // 1336Hz
    FilterParams { gain: 8.720029263e+01, y0: -0.9770643703, y1: 0.7895131023 }, // 1477Hz
    FilterParams { gain: 7.896493565e+01, y0: -0.9746723483, y1: 0.5613790789 }, // 1633Hz
];

/// Update a moving average with the square of a value, tracking power
pub fn update_power(avg: &mut f64, val: f64) {
    *avg = MOVING_AVG_KEEP * *avg + (1.0 - MOVING_AVG_KEEP) * val * val;
}

/// One resonator band with its output power estimate
#[derive(Debug, Clone)]
pub struct BandFilter {
    mult: f64,
    y0: f64,
    y1: f64,
    power: f64,
    y: [f64; 3],
}

impl BandFilter {
    pub fn new(params: FilterParams) -> Self {
        Self {
            mult: 1.0 / params.gain,
            y0: params.y0,
            y1: params.y1,
            power: 0.0,
            y: [0.0; 3],
        }
    }

    /// Replace the coefficients and reset state
    pub fn assign(&mut self, params: FilterParams) {
        self.mult = 1.0 / params.gain;
        self.y0 = params.y0;
        self.y1 = params.y1;
        self.reset();
    }

    /// Clear output registers and the power estimate
    pub fn reset(&mut self) {
        self.power = 0.0;
        self.y = [0.0; 3];
    }

    /// Feed one differentiated input sample
    pub fn update(&mut self, xd: f64) {
        self.y[0] = self.y[1];
        self.y[1] = self.y[2];
        self.y[2] = (xd * self.mult) + (self.y0 * self.y[0]) + (self.y1 * self.y[1]);
        update_power(&mut self.power, self.y[2]);
    }

    /// Current output power estimate
    pub fn power(&self) -> f64 {
        self.power
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    // run a sinusoid through the detector front end: differentiate, track
    // total power, feed the band filter
    fn run_tone(filter: &mut BandFilter, freq: f64, samples: usize, amplitude: f64) -> f64 {
        let mut total = 0.0;
        let mut xv = [0.0f64; 3];
        for n in 0..samples {
            xv[0] = xv[1];
            xv[1] = xv[2];
            xv[2] = amplitude * (2.0 * PI * freq * n as f64 / 8000.0).sin();
            let dx = xv[2] - xv[0];
            update_power(&mut total, xv[2]);
            filter.update(dx);
        }
        filter.power() / total
    }

    #[test]
    fn test_cng_band_selectivity() {
        let mut f = BandFilter::new(PARAMS_CNG);
        // in-band: the 1100 Hz filter should capture nearly all the power
        let ratio = run_tone(&mut f, 1100.0, 4000, 10000.0);
        assert!(ratio > 0.95, "in-band ratio {}", ratio);
        // out-of-band: a 400 Hz tone should barely register
        f.reset();
        let ratio = run_tone(&mut f, 400.0, 4000, 10000.0);
        assert!(ratio < 0.1, "out-of-band ratio {}", ratio);
    }

    #[test]
    fn test_ced_band() {
        let mut f = BandFilter::new(PARAMS_CED);
        let ratio = run_tone(&mut f, 2100.0, 4000, 10000.0);
        assert!(ratio > 0.95, "ratio {}", ratio);
    }

    #[test]
    fn test_cot_bands() {
        let mut f = BandFilter::new(PARAMS_COT_V);
        let ratio = run_tone(&mut f, 2010.0, 4000, 10000.0);
        assert!(ratio > 0.90, "cotv ratio {}", ratio);
        let mut f = BandFilter::new(PARAMS_COT_S);
        let ratio = run_tone(&mut f, 1780.0, 4000, 10000.0);
        assert!(ratio > 0.90, "cots ratio {}", ratio);
    }

    #[test]
    fn test_dtmf_row_column_separation() {
        // 770 Hz belongs to row filter 1 and nowhere else
        for (i, params) in PARAMS_DTMF_LOW.iter().enumerate() {
            let mut f = BandFilter::new(*params);
            let ratio = run_tone(&mut f, 770.0, 4000, 10000.0);
            if i == 1 {
                assert!(ratio > 0.8, "filter {} ratio {}", i, ratio);
            } else {
                assert!(ratio < 0.2, "filter {} ratio {}", i, ratio);
            }
        }
        // 1336 Hz belongs to column filter 1
        for (i, params) in PARAMS_DTMF_HIGH.iter().enumerate() {
            let mut f = BandFilter::new(*params);
            let ratio = run_tone(&mut f, 1336.0, 4000, 10000.0);
            if i == 1 {
                assert!(ratio > 0.8, "filter {} ratio {}", i, ratio);
            } else {
                assert!(ratio < 0.2, "filter {} ratio {}", i, ratio);
            }
        }
    }

    #[test]
    fn test_assign_resets_state() {
        let mut f = BandFilter::new(PARAMS_CNG);
        run_tone(&mut f, 1100.0, 800, 10000.0);
        assert!(f.power() > 0.0);
        f.assign(PARAMS_CED);
        assert_eq!(f.power(), 0.0);
    }
}
