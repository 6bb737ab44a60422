#[cfg(test)]
mod proptest_safety {
    use crate::control_loop::ChargeIntegrator;
    use crate::safety::*;
    use proptest::prelude::*;
    use std::time::Duration;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(2000))]

        #[test]
        fn setpoints_within_rating_accepted(
            volts in 0.0f64..=20.0,
            milliamps in 0.0f64..=5000.0,
        ) {
            let result = Setpoint::new(volts, milliamps).validate(&SupplyLimits::hp6632b());
            prop_assert!(result.is_ok(), "rejected {} V / {} mA: {:?}", volts, milliamps, result);
        }

        #[test]
        fn overcurrent_always_rejected(
            volts in 0.0f64..=20.0,
            milliamps in 5000.01f64..1e6,
        ) {
            let result = Setpoint::new(volts, milliamps).validate(&SupplyLimits::hp6632b());
            let rejected = matches!(result, Err(SafetyViolation::ExceedsCurrentRating { .. }));
            prop_assert!(rejected, "expected ExceedsCurrentRating, got {:?}", result);
        }

        #[test]
        fn negative_values_always_rejected(
            volts in -100.0f64..-1e-9,
            milliamps in 0.0f64..=5000.0,
        ) {
            let limits = SupplyLimits::hp6632b();
            prop_assert!(Setpoint::new(volts, milliamps).validate(&limits).is_err());
            prop_assert!(Setpoint::new(milliamps / 1000.0, volts).validate(&limits).is_err());
        }

        #[test]
        fn non_finite_always_rejected(milliamps in 0.0f64..=5000.0) {
            let limits = SupplyLimits::hp6632b();
            for bad in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
                let result = Setpoint::new(bad, milliamps).validate(&limits);
                let rejected = matches!(result, Err(SafetyViolation::NonFiniteSetpoint { .. }));
                prop_assert!(rejected, "expected NonFiniteSetpoint for {}, got {:?}", bad, result);
            }
        }

        // Accumulated charge is the sum of per-sample increments, whatever the order.
        #[test]
        fn integrator_matches_sum_of_samples(
            samples in prop::collection::vec(-5.0f64..5.0, 0..200),
            interval_s in 1u64..120,
        ) {
            let mut forward = ChargeIntegrator::new(Duration::from_secs(interval_s));
            let mut reversed = ChargeIntegrator::new(Duration::from_secs(interval_s));
            for amps in &samples {
                forward.charge(*amps);
            }
            for amps in samples.iter().rev() {
                reversed.discharge(*amps);
            }

            let expected: f64 = samples.iter().sum::<f64>() * 1000.0 * interval_s as f64 / 3600.0;
            prop_assert!((forward.mah() - expected).abs() < 1e-6);
            prop_assert!((forward.mah() + reversed.mah()).abs() < 1e-6);
        }
    }
}
