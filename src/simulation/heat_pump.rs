use itertools::Itertools;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use crate::error::{ensure_finite, ControlError, ControlResult};

const MODULATION_TOLERANCE: f64 = 1e-9;
const ENVELOPE_SAMPLE_K: f64 = 1.0;

/// Coefficient of performance as a function of (source, sink) temperature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CopCurve {
    /// Bilinear interpolation over a grid, `cop[source][sink]`. Queries off
    /// the grid take the nearest edge value.
    Table {
        source_temps_c: Vec<f64>,
        sink_temps_c: Vec<f64>,
        cop: Vec<Vec<f64>>,
    },
    /// `c0 + c1·Ts + c2·Ts² + c3·Tk + c4·Tk² + c5·Ts·Tk`, with a separate
    /// coefficient set while the source is at or below the defrost threshold.
    /// Queries are clamped into the fitted envelope.
    Regression {
        coefficients: [f64; 6],
        defrost_coefficients: [f64; 6],
        defrost_below_c: f64,
        source_range_c: (f64, f64),
        sink_range_c: (f64, f64),
    },
}

impl Default for CopCurve {
    fn default() -> Self {
        CopCurve::Table {
            source_temps_c: vec![-15.0, -7.0, 2.0, 7.0, 12.0, 20.0],
            sink_temps_c: vec![30.0, 40.0, 50.0, 60.0, 70.0, 85.0],
            cop: vec![
                vec![2.86, 2.49, 2.21, 2.01, 1.84, 1.66],
                vec![3.37, 2.85, 2.49, 2.22, 2.02, 1.79],
                vec![4.21, 3.40, 2.89, 2.52, 2.26, 1.97],
                vec![4.89, 3.82, 3.17, 2.73, 2.42, 2.08],
                vec![5.83, 4.35, 3.51, 2.97, 2.60, 2.21],
                vec![8.42, 5.59, 4.25, 3.47, 2.96, 2.45],
            ],
        }
    }
}

impl CopCurve {
    /// Air-to-water regression for a 14 kW monobloc unit.
    pub fn air_source_regression() -> Self {
        CopCurve::Regression {
            coefficients: [
                5.526028912,
                0.1251938,
                -0.000714286,
                -0.054584426,
                -3.17198e-05,
                -0.001400534,
            ],
            defrost_coefficients: [
                3.254509975,
                0.055426116,
                0.007181906,
                -0.001549673,
                -0.000509163,
                -0.00051864,
            ],
            defrost_below_c: 2.0,
            source_range_c: (-10.0, 20.0),
            sink_range_c: (25.0, 55.0),
        }
    }

    pub fn at(&self, source_c: f64, sink_c: f64) -> f64 {
        match self {
            CopCurve::Table {
                source_temps_c,
                sink_temps_c,
                cop,
            } => {
                let (i0, i1, fi) = bracket(source_temps_c, source_c);
                let (j0, j1, fj) = bracket(sink_temps_c, sink_c);
                let low = lerp(cop[i0][j0], cop[i0][j1], fj);
                let high = lerp(cop[i1][j0], cop[i1][j1], fj);
                lerp(low, high, fi)
            }
            CopCurve::Regression {
                coefficients,
                defrost_coefficients,
                defrost_below_c,
                source_range_c,
                sink_range_c,
            } => {
                let ts = source_c.clamp(source_range_c.0, source_range_c.1);
                let tk = sink_c.clamp(sink_range_c.0, sink_range_c.1);
                let c = if ts <= *defrost_below_c {
                    defrost_coefficients
                } else {
                    coefficients
                };
                c[0] + c[1] * ts + c[2] * ts * ts + c[3] * tk + c[4] * tk * tk + c[5] * ts * tk
            }
        }
    }

    fn check_shape(&self) -> ControlResult<()> {
        match self {
            CopCurve::Table {
                source_temps_c,
                sink_temps_c,
                cop,
            } => {
                if source_temps_c.is_empty() || sink_temps_c.is_empty() {
                    return Err(ControlError::ModelConfiguration(
                        "COP table needs at least one source and one sink temperature".into(),
                    ));
                }
                for axis in [source_temps_c, sink_temps_c] {
                    if axis.iter().any(|t| !t.is_finite())
                        || axis.iter().tuple_windows().any(|(a, b)| a >= b)
                    {
                        return Err(ControlError::ModelConfiguration(
                            "COP table axes must be finite and strictly increasing".into(),
                        ));
                    }
                }
                if cop.len() != source_temps_c.len()
                    || cop.iter().any(|row| row.len() != sink_temps_c.len())
                {
                    return Err(ControlError::ModelConfiguration(format!(
                        "COP table must be {}x{}",
                        source_temps_c.len(),
                        sink_temps_c.len()
                    )));
                }
                Ok(())
            }
            CopCurve::Regression {
                coefficients,
                defrost_coefficients,
                defrost_below_c,
                source_range_c,
                sink_range_c,
            } => {
                let bounds = [
                    source_range_c.0,
                    source_range_c.1,
                    sink_range_c.0,
                    sink_range_c.1,
                    *defrost_below_c,
                ];
                if bounds
                    .iter()
                    .chain(coefficients)
                    .chain(defrost_coefficients)
                    .any(|v| !v.is_finite())
                {
                    return Err(ControlError::ModelConfiguration(
                        "COP regression coefficients and envelope must be finite".into(),
                    ));
                }
                if source_range_c.0 > source_range_c.1 || sink_range_c.0 > sink_range_c.1 {
                    return Err(ControlError::ModelConfiguration(
                        "COP regression envelope is empty".into(),
                    ));
                }
                Ok(())
            }
        }
    }

    /// Every value the curve can return, or a dense sample of them.
    fn envelope_values(&self) -> Vec<f64> {
        match self {
            CopCurve::Table { cop, .. } => cop.iter().flatten().copied().collect(),
            CopCurve::Regression {
                defrost_below_c,
                source_range_c,
                sink_range_c,
                ..
            } => {
                let mut sources = sample(*source_range_c);
                if (source_range_c.0..=source_range_c.1).contains(defrost_below_c) {
                    sources.push(*defrost_below_c);
                }
                let sinks = sample(*sink_range_c);
                sources
                    .iter()
                    .cartesian_product(sinks.iter())
                    .map(|(&s, &k)| self.at(s, k))
                    .collect()
            }
        }
    }
}

fn sample(range: (f64, f64)) -> Vec<f64> {
    let steps = ((range.1 - range.0) / ENVELOPE_SAMPLE_K).ceil().max(0.0) as usize;
    let mut out: Vec<f64> = (0..=steps)
        .map(|i| (range.0 + i as f64 * ENVELOPE_SAMPLE_K).min(range.1))
        .collect();
    out.dedup();
    out
}

fn bracket(axis: &[f64], x: f64) -> (usize, usize, f64) {
    let last = axis.len() - 1;
    if x <= axis[0] {
        return (0, 0, 0.0);
    }
    if x >= axis[last] {
        return (last, last, 0.0);
    }
    let i = axis.partition_point(|&a| a <= x) - 1;
    (i, i + 1, (x - axis[i]) / (axis[i + 1] - axis[i]))
}

fn lerp(a: f64, b: f64, f: f64) -> f64 {
    a + (b - a) * f
}

/// Static device data as configured.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeatPumpSpec {
    pub nominal_thermal_kw: f64,
    pub min_modulation: f64,
    pub max_modulation: f64,
    /// Largest modulation change between consecutive steps
    pub ramp_limit: f64,
    pub cop_curve: CopCurve,
    pub cop_ceiling: f64,
    /// Condenser outlet above the store's charge-port temperature (K)
    pub sink_approach_k: f64,
}

impl Default for HeatPumpSpec {
    fn default() -> Self {
        Self {
            nominal_thermal_kw: 14.0,
            min_modulation: 0.0,
            max_modulation: 1.0,
            ramp_limit: 1.0,
            cop_curve: CopCurve::default(),
            cop_ceiling: 10.0,
            sink_approach_k: 5.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeatPumpOutput {
    pub thermal_kw: f64,
    pub electrical_kw: f64,
    pub cop: f64,
}

/// A validated heat pump. Construction checks the whole COP curve, so a bad
/// curve never reaches the control loop.
#[derive(Debug, Clone)]
pub struct HeatPumpModel {
    spec: HeatPumpSpec,
    max_cop: f64,
}

impl HeatPumpModel {
    pub fn new(spec: HeatPumpSpec) -> ControlResult<Self> {
        if !(spec.nominal_thermal_kw.is_finite() && spec.nominal_thermal_kw > 0.0) {
            return Err(ControlError::Configuration(format!(
                "nominal thermal capacity must be positive, got {}",
                spec.nominal_thermal_kw
            )));
        }
        if !(0.0 <= spec.min_modulation
            && spec.min_modulation <= spec.max_modulation
            && spec.max_modulation <= 1.0)
        {
            return Err(ControlError::Configuration(format!(
                "modulation bounds [{}, {}] must satisfy 0 <= min <= max <= 1",
                spec.min_modulation, spec.max_modulation
            )));
        }
        if !(spec.ramp_limit.is_finite() && spec.ramp_limit > 0.0) {
            return Err(ControlError::Configuration(
                "ramp limit must be positive".into(),
            ));
        }
        if !(spec.sink_approach_k.is_finite() && spec.sink_approach_k >= 0.0) {
            return Err(ControlError::Configuration(
                "sink approach must be non-negative".into(),
            ));
        }
        if !(spec.cop_ceiling.is_finite() && spec.cop_ceiling >= 1.0) {
            return Err(ControlError::ModelConfiguration(format!(
                "COP ceiling {} is below 1",
                spec.cop_ceiling
            )));
        }
        spec.cop_curve.check_shape()?;
        let values = spec.cop_curve.envelope_values();
        if let Some(bad) = values
            .iter()
            .find(|c| !c.is_finite() || **c < 1.0 || **c > spec.cop_ceiling)
        {
            return Err(ControlError::ModelConfiguration(format!(
                "COP curve yields {bad}, outside [1, {}]",
                spec.cop_ceiling
            )));
        }
        let max_cop = values
            .iter()
            .copied()
            .map(OrderedFloat)
            .max()
            .map(|c| c.0)
            .unwrap_or(spec.cop_ceiling);
        Ok(Self { spec, max_cop })
    }

    pub fn spec(&self) -> &HeatPumpSpec {
        &self.spec
    }

    /// Highest COP the curve can produce anywhere.
    pub fn max_possible_cop(&self) -> f64 {
        self.max_cop
    }

    pub fn min_modulation(&self) -> f64 {
        self.spec.min_modulation
    }

    pub fn max_modulation(&self) -> f64 {
        self.spec.max_modulation
    }

    pub fn ramp_limit(&self) -> f64 {
        self.spec.ramp_limit
    }

    pub fn nominal_thermal_kw(&self) -> f64 {
        self.spec.nominal_thermal_kw
    }

    /// Condenser temperature when charging a node at `store_c`.
    pub fn sink_temp_c(&self, store_c: f64) -> f64 {
        store_c + self.spec.sink_approach_k
    }

    pub fn clamp_modulation(&self, modulation: f64) -> f64 {
        modulation.clamp(self.spec.min_modulation, self.spec.max_modulation)
    }

    pub fn output(
        &self,
        modulation: f64,
        source_c: f64,
        sink_c: f64,
    ) -> ControlResult<HeatPumpOutput> {
        ensure_finite("modulation", modulation)?;
        ensure_finite("source temperature", source_c)?;
        ensure_finite("sink temperature", sink_c)?;
        if modulation < self.spec.min_modulation - MODULATION_TOLERANCE
            || modulation > self.spec.max_modulation + MODULATION_TOLERANCE
        {
            return Err(ControlError::InputValidation(format!(
                "modulation {modulation} outside [{}, {}]",
                self.spec.min_modulation, self.spec.max_modulation
            )));
        }
        let cop = self.spec.cop_curve.at(source_c, sink_c);
        if !cop.is_finite() || cop < 1.0 || cop > self.spec.cop_ceiling {
            return Err(ControlError::ModelConfiguration(format!(
                "COP {cop} at source {source_c} °C, sink {sink_c} °C"
            )));
        }
        let thermal_kw = self.clamp_modulation(modulation) * self.spec.nominal_thermal_kw;
        Ok(HeatPumpOutput {
            thermal_kw,
            electrical_kw: thermal_kw / cop,
            cop,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    fn flat(cop: f64) -> CopCurve {
        CopCurve::Table {
            source_temps_c: vec![0.0],
            sink_temps_c: vec![50.0],
            cop: vec![vec![cop]],
        }
    }

    #[test]
    fn test_default_curve_is_valid() {
        let hp = HeatPumpModel::new(HeatPumpSpec::default()).unwrap();
        assert!((hp.max_possible_cop() - 8.42).abs() < 1e-12);
    }

    #[test]
    fn test_bilinear_interpolation() {
        let curve = CopCurve::default();
        // midway between (2,50)=2.89, (2,60)=2.52, (7,50)=3.17, (7,60)=2.73
        let expected = (2.89 + 2.52 + 3.17 + 2.73) / 4.0;
        assert!((curve.at(4.5, 55.0) - expected).abs() < 1e-9);
        assert!((curve.at(-40.0, 200.0) - 1.66).abs() < 1e-12);
    }

    #[test]
    fn test_regression_defrost_branch() {
        let curve = CopCurve::air_source_regression();
        let mild = curve.at(8.2, 45.0);
        let cold = curve.at(-3.0, 45.0);
        assert!(mild > cold);
        assert!((mild - 3.467).abs() < 0.01);
    }

    #[test]
    fn test_regression_curve_validates_in_envelope() {
        let spec = HeatPumpSpec {
            cop_curve: CopCurve::air_source_regression(),
            ..Default::default()
        };
        assert!(HeatPumpModel::new(spec).is_ok());
    }

    #[test]
    fn test_regression_outside_useful_range_is_rejected() {
        let mut curve = CopCurve::air_source_regression();
        if let CopCurve::Regression { sink_range_c, .. } = &mut curve {
            *sink_range_c = (25.0, 85.0);
        }
        let spec = HeatPumpSpec {
            cop_curve: curve,
            ..Default::default()
        };
        assert!(matches!(
            HeatPumpModel::new(spec),
            Err(ControlError::ModelConfiguration(_))
        ));
    }

    #[rstest]
    #[case::source_low(0)]
    #[case::sink_high(1)]
    #[case::defrost(2)]
    fn test_nan_regression_envelope_is_model_error(#[case] field: usize) {
        let mut curve = CopCurve::air_source_regression();
        if let CopCurve::Regression {
            source_range_c,
            sink_range_c,
            defrost_below_c,
            ..
        } = &mut curve
        {
            match field {
                0 => source_range_c.0 = f64::NAN,
                1 => sink_range_c.1 = f64::NAN,
                _ => *defrost_below_c = f64::NAN,
            }
        }
        let spec = HeatPumpSpec {
            cop_curve: curve,
            ..Default::default()
        };
        assert!(matches!(
            HeatPumpModel::new(spec),
            Err(ControlError::ModelConfiguration(_))
        ));
    }

    #[rstest]
    #[case(0.5)]
    #[case(1.0e6)]
    fn test_cop_out_of_bounds_is_model_error(#[case] cop: f64) {
        let spec = HeatPumpSpec {
            cop_curve: flat(cop),
            ..Default::default()
        };
        assert!(matches!(
            HeatPumpModel::new(spec),
            Err(ControlError::ModelConfiguration(_))
        ));
    }

    #[test]
    fn test_ragged_table_is_model_error() {
        let spec = HeatPumpSpec {
            cop_curve: CopCurve::Table {
                source_temps_c: vec![0.0, 10.0],
                sink_temps_c: vec![40.0, 60.0],
                cop: vec![vec![3.0, 2.5], vec![3.5]],
            },
            ..Default::default()
        };
        assert!(matches!(
            HeatPumpModel::new(spec),
            Err(ControlError::ModelConfiguration(_))
        ));
    }

    #[rstest]
    #[case(-0.1)]
    #[case(0.1)]
    #[case(0.95)]
    #[case(1.5)]
    fn test_modulation_outside_bounds_rejected(#[case] modulation: f64) {
        let spec = HeatPumpSpec {
            min_modulation: 0.2,
            max_modulation: 0.9,
            ..Default::default()
        };
        let hp = HeatPumpModel::new(spec).unwrap();
        assert!(matches!(
            hp.output(modulation, 5.0, 50.0),
            Err(ControlError::InputValidation(_))
        ));
    }

    #[rstest]
    #[case(0.2, 2.8)]
    #[case(0.5, 7.0)]
    #[case(0.9, 12.6)]
    fn test_thermal_scales_with_modulation(#[case] modulation: f64, #[case] thermal: f64) {
        let spec = HeatPumpSpec {
            min_modulation: 0.2,
            max_modulation: 0.9,
            cop_curve: flat(3.5),
            ..Default::default()
        };
        let hp = HeatPumpModel::new(spec).unwrap();
        let out = hp.output(modulation, 5.0, 50.0).unwrap();
        assert!((out.thermal_kw - thermal).abs() < 1e-9);
        assert!((out.electrical_kw - thermal / 3.5).abs() < 1e-9);
    }

    #[test]
    fn test_bad_bounds_fail_construction() {
        let spec = HeatPumpSpec {
            min_modulation: 0.8,
            max_modulation: 0.3,
            ..Default::default()
        };
        assert!(matches!(
            HeatPumpModel::new(spec),
            Err(ControlError::Configuration(_))
        ));
    }

    proptest! {
        #[test]
        fn prop_electrical_at_least_thermal_over_max_cop(
            modulation in 0.0f64..=1.0,
            source in -30.0f64..30.0,
            sink in 20.0f64..95.0,
        ) {
            let hp = HeatPumpModel::new(HeatPumpSpec::default()).unwrap();
            let out = hp.output(modulation, source, sink).unwrap();
            prop_assert!(out.electrical_kw >= out.thermal_kw / hp.max_possible_cop() - 1e-12);
        }
    }
}
