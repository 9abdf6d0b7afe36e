//! A night-time wind spike should be stored rather than bought later.

use chrono::{DateTime, Duration, TimeZone, Utc};
use district_heat_mpc::controller::{Scheduler, SchedulerSettings, TickBudget};
use district_heat_mpc::domain::{ForecastBundle, ForecastSeries, HorizonWindow, SeriesKind};
use district_heat_mpc::forecast::FixedForecastProvider;
use district_heat_mpc::optimizer::{HorizonOptimizer, PlanContext, PlanningConstraints};
use district_heat_mpc::simulation::{CopCurve, HeatPumpModel, HeatPumpSpec, TankSpec, ThermalStoreState};
use district_heat_mpc::TickFlag;
use std::sync::Arc;

const NOMINAL_KW: f64 = 10.0;
const COP: f64 = 3.0;
const SPIKE: std::ops::RangeInclusive<usize> = 1..=4;

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 20, 0, 0, 0).unwrap()
}

fn heat_pump() -> HeatPumpModel {
    HeatPumpModel::new(HeatPumpSpec {
        nominal_thermal_kw: NOMINAL_KW,
        cop_curve: CopCurve::Table {
            source_temps_c: vec![0.0],
            sink_temps_c: vec![50.0],
            cop: vec![vec![COP]],
        },
        ..Default::default()
    })
    .unwrap()
}

fn constraints() -> PlanningConstraints {
    PlanningConstraints {
        min_safe_c: 35.0,
        max_safe_c: 80.0,
        ..Default::default()
    }
}

fn wind(hours: usize) -> Vec<f64> {
    (0..hours)
        .map(|h| if SPIKE.contains(&h) { NOMINAL_KW / COP } else { 0.0 })
        .collect()
}

fn bundle() -> ForecastBundle {
    let window = HorizonWindow::new(start(), 60, 24);
    ForecastBundle::assemble(
        window,
        ForecastSeries::from_values(SeriesKind::Pv, &window, &[0.0; 24]),
        ForecastSeries::from_values(SeriesKind::Wind, &window, &wind(24)),
        ForecastSeries::from_values(SeriesKind::Demand, &window, &[2.0; 24]),
        None,
    )
    .unwrap()
}

fn tank() -> ThermalStoreState {
    ThermalStoreState::uniform(&TankSpec::default(), 45.0).unwrap()
}

#[test]
fn plan_concentrates_heating_in_wind_spike() {
    let optimizer = HorizonOptimizer::with_defaults(constraints()).unwrap();
    let hp = heat_pump();
    let forecasts = bundle();
    let outcome = optimizer
        .plan(&forecasts, &tank(), &hp, 24, PlanContext::default())
        .unwrap();
    let plan = &outcome.plan;
    assert_eq!(plan.len(), 24);
    assert!(!plan.has_flag(TickFlag::DemandShortfall));

    let m = plan.modulations();
    let spike: f64 = SPIKE.clone().map(|h| m[h]).sum();
    let total: f64 = m.iter().sum();
    let off_spike_mean = (total - spike) / 20.0;
    assert!(spike / 4.0 > 0.5, "spike modulations {m:?}");
    assert!(off_spike_mean < 0.1, "off-spike modulations {m:?}");
    assert!(spike / total > 0.75);

    // running continuously to follow demand buys far more
    let (continuous, _) = optimizer.evaluate(&forecasts, &tank(), &hp, &[0.2; 24]).unwrap();
    assert!(plan.predicted.grid_import_kwh < 0.5 * continuous.grid_import_kwh);
    assert!(plan.predicted.peak_node_c <= 80.0 + 1e-9);
    assert!(outcome.constraints.max_safety_kh == 0.0);
}

#[tokio::test]
async fn committed_steps_follow_the_spike() {
    let hours = 48;
    let provider = FixedForecastProvider::new()
        .with_values(SeriesKind::Pv, start(), 60, &vec![0.0; hours])
        .with_values(SeriesKind::Wind, start(), 60, &wind(hours))
        .with_values(SeriesKind::Demand, start(), 60, &vec![2.0; hours]);
    let optimizer = HorizonOptimizer::with_defaults(constraints()).unwrap();
    let settings = SchedulerSettings {
        horizon_steps: 24,
        use_source_temperature: false,
        ..Default::default()
    };
    let mut scheduler =
        Scheduler::new(Arc::new(provider), optimizer, heat_pump(), tank(), settings).unwrap();

    let totals = scheduler
        .run_simulation(start(), TickBudget::Count(6))
        .await
        .unwrap();
    assert_eq!(totals.ticks, 6);

    let entries = scheduler.trace().entries();
    let spike_mean: f64 = SPIKE.clone().map(|h| entries[h].modulation).sum::<f64>() / 4.0;
    assert!(spike_mean > 0.5);
    assert!(entries[0].modulation < 0.2);
    assert!(entries
        .iter()
        .flat_map(|e| e.node_temps_c.iter())
        .all(|&t| t <= 80.0 + 1e-9));
    assert_eq!(entries[5].timestamp, start() + Duration::hours(5));
}
