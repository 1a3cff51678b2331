use tdc_engine::errors::Error;
use tdc_engine::tdc_tools::coincidence::{counter_label, COINC_COUNTERS};
use tdc_engine::Engine;

fn counter_index(label: &str) -> usize {
    (0..COINC_COUNTERS)
        .find(|&i| counter_label(i).as_deref() == Some(label))
        .unwrap()
}

#[test]
fn ring_buffer_keeps_newest_events() {
    let engine = Engine::new();
    assert_eq!(engine.timestamp_buffer_size(), 0);
    engine.input_timestamps(&[1, 2], &[1, 2]).unwrap();
    assert_eq!(engine.last_timestamps(false).valid, 0);

    engine.set_timestamp_buffer_size(4).unwrap();
    let times: Vec<i64> = (0..10).map(|t| t * 100).collect();
    let channels: Vec<u8> = (0..10).map(|c| (c % 3 + 1) as u8).collect();
    engine.input_timestamps(&times, &channels).unwrap();

    let snapshot = engine.last_timestamps(true);
    assert_eq!(snapshot.valid, 4);
    assert_eq!(snapshot.timestamps(), vec![600, 700, 800, 900]);
    assert_eq!(snapshot.channels(), vec![1, 2, 3, 1]);
    assert_eq!(engine.last_timestamps(false).valid, 0);

    assert!(matches!(
        engine.set_timestamp_buffer_size(0),
        Err(Error::InvalidParameter(_))
    ));
}

#[test]
fn coincidences_pairs_and_triples() {
    let engine = Engine::new();
    engine.set_coincidence_params(100, 0).unwrap();
    engine
        .input_timestamps(
            &[0, 40, 10_000, 10_050, 10_090, 20_000, 20_500],
            &[1, 2, 1, 3, 4, 2, 5],
        )
        .unwrap();

    let counters = engine.coinc_counters().counters;
    assert_eq!(counters[1], 2);
    assert_eq!(counters[2], 2);
    assert_eq!(counters[counter_index("1/2")], 1);
    assert_eq!(counters[counter_index("1/3")], 1);
    assert_eq!(counters[counter_index("1/4")], 1);
    assert_eq!(counters[counter_index("3/4")], 1);
    assert_eq!(counters[counter_index("1/3/4")], 1);
    assert_eq!(counters[counter_index("2/5")], 0);
    assert_eq!(counters[counter_index("1/2/3")], 0);
}

#[test]
fn coincidences_follow_the_latest_event() {
    let engine = Engine::new();
    engine.set_coincidence_params(100, 0).unwrap();
    engine
        .input_timestamps(&[0, 60, 150, 1_000, 1_090, 1_150], &[1, 1, 2, 2, 3, 4])
        .unwrap();

    let counters = engine.coinc_counters().counters;
    assert_eq!(counters[counter_index("1/2")], 1);
    assert_eq!(counters[counter_index("2/3")], 1);
    assert_eq!(counters[counter_index("3/4")], 1);
    assert_eq!(counters[counter_index("2/4")], 0);
}

#[test]
fn coincidences_publish_per_exposure() {
    let engine = Engine::new();
    engine.set_coincidence_params(1_000, 1).unwrap();
    let ms = 1_000_000_000;
    engine
        .input_timestamps(&[0, 10, ms + 5, 3 * ms + 1], &[1, 2, 1, 1])
        .unwrap();

    // the last event closes the second period and skips the third
    let snapshot = engine.coinc_counters();
    assert_eq!(snapshot.updates, 3);
    assert_eq!(snapshot.counters, [0; COINC_COUNTERS]);
    assert_eq!(engine.coinc_counters().updates, 0);
}

#[test]
fn freezing_is_idempotent() {
    let engine = Engine::new();
    engine.histograms().set_params(10, 100).unwrap();
    engine.histograms().add_histogram(0, 1).unwrap();
    engine.histograms().enable(true);
    engine.input_timestamps(&[0, 55], &[0, 1]).unwrap();

    engine.freeze_buffers(true);
    engine.freeze_buffers(true);
    assert!(engine.buffers_frozen());
    engine.input_timestamps(&[100, 120], &[0, 1]).unwrap();
    let frozen = engine.histograms().read(0, 1, false).unwrap();
    assert_eq!(frozen.counts, 1);
    assert_eq!(frozen.bins[5], 1);

    engine.freeze_buffers(false);
    engine.freeze_buffers(false);
    engine.input_timestamps(&[200, 230], &[0, 1]).unwrap();
    let hist = engine.histograms().read(0, 1, false).unwrap();
    assert_eq!(hist.counts, 2);
    assert_eq!(hist.bins[3], 1);
}

#[test]
fn disabled_histograms_report_not_enabled() {
    let engine = Engine::new();
    assert!(matches!(
        engine.histograms().read(0, 1, false),
        Err(Error::NotEnabled(_))
    ));
    engine.histograms().enable(true);
    assert!(matches!(
        engine.histograms().read(0, 1, false),
        Err(Error::InvalidParameter(_))
    ));
}

#[test]
fn hg2_single_triple() {
    let engine = Engine::new();
    engine.hg2().enable(true);
    engine.hg2().set_params(10, 16).unwrap();
    engine
        .input_timestamps(&[1_000, 1_000, 1_020], &[1, 2, 3])
        .unwrap();

    // the idler stays pending until its window has passed
    assert_eq!(engine.hg2().raw().unwrap().idler_events, 0);
    engine.flush();

    let raw = engine.hg2().raw().unwrap();
    assert_eq!(raw.idler_events, 1);
    assert_eq!(raw.coinc_events, 1);
    assert_eq!(raw.hist_signal1_idler[8], 1);
    assert_eq!(raw.hist_signal2_idler[10], 1);

    let g2 = engine.hg2().calc_g2(false).unwrap();
    assert_eq!(g2.len(), 16);
    assert_eq!(g2[10], 1.0);
    assert!(g2.iter().enumerate().all(|(k, &v)| k == 10 || v == 0.));

    let tcp = engine.hg2().calc_tcp(false).unwrap();
    assert_eq!(tcp[[8, 10]], 1);
    assert_eq!(tcp.sum(), 1);

    let flat = engine.hg2().calc_tcp_1d(true).unwrap();
    assert_eq!(flat.len(), 256);
    assert_eq!(flat[8 + 10 * 16], 1);
    assert_eq!(flat.iter().sum::<i64>(), 1);
    assert_eq!(engine.hg2().raw().unwrap().idler_events, 0);
}

#[test]
fn hg2_requires_enable() {
    let engine = Engine::new();
    assert!(matches!(engine.hg2().calc_g2(false), Err(Error::NotEnabled(_))));
    assert!(matches!(engine.hg2().calc_tcp_1d(false), Err(Error::NotEnabled(_))));
    assert!(engine.hg2().set_input(1, 1, 2).is_err());
    assert!(engine.hg2().set_params(0, 16).is_err());
}

#[test]
fn reconfiguration_clears_results() {
    let engine = Engine::new();
    engine.set_coincidence_params(100, 0).unwrap();
    engine.histograms().add_histogram(1, 2).unwrap();
    engine.histograms().enable(true);
    engine.hg2().enable(true);
    engine.hg2().set_params(10, 16).unwrap();

    engine
        .input_timestamps(&[0, 5, 10, 1_000], &[1, 2, 3, 4])
        .unwrap();
    engine.flush();
    assert_eq!(engine.coinc_counters().counters[1], 1);
    assert_eq!(engine.histograms().read(1, 2, false).unwrap().counts, 1);
    assert_eq!(engine.hg2().raw().unwrap().idler_events, 1);

    engine.set_coincidence_params(200, 0).unwrap();
    engine.histograms().set_params(10, 50).unwrap();
    engine.hg2().set_input(4, 2, 3).unwrap();

    assert_eq!(engine.coinc_counters().counters, [0; COINC_COUNTERS]);
    let hist = engine.histograms().read(1, 2, false).unwrap();
    assert_eq!(hist.counts, 0);
    assert_eq!(hist.bins.len(), 50);
    assert_eq!(engine.hg2().raw().unwrap().idler_events, 0);
}

#[test]
fn reset_keeps_configuration() {
    let engine = Engine::new();
    engine.set_timestamp_buffer_size(10).unwrap();
    engine.set_coincidence_params(100, 0).unwrap();
    engine.hg2().enable(true);
    engine.hg2().set_params(10, 16).unwrap();
    engine
        .input_timestamps(&[0, 5, 10], &[1, 2, 3])
        .unwrap();
    engine.flush();
    assert_eq!(engine.hg2().raw().unwrap().idler_events, 1);

    engine.reset();
    assert_eq!(engine.last_timestamps(false).valid, 0);
    assert_eq!(engine.coinc_counters().counters, [0; COINC_COUNTERS]);
    assert_eq!(engine.hg2().raw().unwrap().idler_events, 0);
    assert_eq!(engine.hg2().params().bin_count, 16);
    assert_eq!(engine.coincidence_params().window_ps, 100);
}

#[test]
fn delays_reorder_channels() {
    let engine = Engine::new();
    engine.set_timestamp_buffer_size(10).unwrap();
    engine.set_channel_delay(1, 500).unwrap();
    engine
        .input_timestamps(&[0, 100, 1_000], &[1, 2, 2])
        .unwrap();
    engine.flush();

    let snapshot = engine.last_timestamps(false);
    assert_eq!(snapshot.timestamps(), vec![100, 500, 1_000]);
    assert_eq!(snapshot.channels(), vec![2, 1, 2]);
}

#[test]
fn channel_mask_filters_input() {
    let engine = Engine::new();
    engine.set_timestamp_buffer_size(10).unwrap();
    engine.enable_channels(false, 0b10);
    engine
        .input_timestamps(&[0, 1, 2, 3], &[0, 1, 2, 3])
        .unwrap();
    assert_eq!(engine.last_timestamps(false).channels(), vec![2]);
}
