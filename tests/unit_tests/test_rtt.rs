// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use docdb_client_rs::sdam::rtt::RttSampler;

#[test]
fn average_blends_with_a_fifth_weight() {
    let mut sampler = RttSampler::new();
    assert_eq!(sampler.average(), None);

    sampler.add_sample(Duration::from_millis(100));
    assert_eq!(sampler.average(), Some(Duration::from_millis(100)));

    sampler.add_sample(Duration::from_millis(200));
    // 100 * 0.8 + 200 * 0.2 = 120
    let avg = sampler.average().expect("average");
    assert!((avg.as_secs_f64() - 0.120).abs() < 1e-9);
}

#[test]
fn minimum_is_zero_until_two_samples_exist() {
    let mut sampler = RttSampler::new();
    assert_eq!(sampler.min(), Duration::ZERO);

    sampler.add_sample(Duration::from_millis(50));
    assert_eq!(sampler.min(), Duration::ZERO);

    sampler.add_sample(Duration::from_millis(30));
    assert_eq!(sampler.min(), Duration::from_millis(30));
}

#[test]
fn minimum_window_holds_ten_samples() {
    let mut sampler = RttSampler::new();
    sampler.add_sample(Duration::from_millis(1));
    for i in 0..10 {
        sampler.add_sample(Duration::from_millis(100 + i));
    }
    // The 1 ms outlier has aged out of the ten-sample ring.
    assert_eq!(sampler.min(), Duration::from_millis(100));
}

#[test]
fn reset_returns_to_the_initial_state() {
    let mut sampler = RttSampler::new();
    sampler.add_sample(Duration::from_millis(10));
    sampler.add_sample(Duration::from_millis(20));
    sampler.reset();

    assert_eq!(sampler.average(), None);
    assert_eq!(sampler.min(), Duration::ZERO);

    sampler.add_sample(Duration::from_millis(40));
    assert_eq!(sampler.average(), Some(Duration::from_millis(40)));
}
