mod common;

use approx::assert_relative_eq;
use common::*;
use ndarray::Array3;
use phytostat_core::{CRS, MemoryRaster};
use phytostat_extract::{
    extract, plan_extraction, CancellationToken, ExtractConfig, ExtractError, FeatureStatus,
    RegisteredSource, ResultTable, SourceKind, SourceSet, Statistic, Strategy, TileMode,
};
use std::sync::Arc;

fn run(sources: &SourceSet, config: &ExtractConfig, n: usize) -> ResultTable {
    extract(sources, &scattered_crowns(n), config, &CancellationToken::new()).unwrap()
}

fn all_modes() -> Vec<ExtractConfig> {
    let base = ExtractConfig::default().with_statistics(vec![
        Statistic::Mean,
        Statistic::Std,
        Statistic::Min,
        Statistic::Max,
        Statistic::Count,
        Statistic::Median,
        Statistic::Percentile(90.0),
    ]);
    let mut configs = Vec::new();
    for concurrency in [1, 3] {
        let base = base.clone().with_concurrency(concurrency);
        configs.push(base.clone().with_tile_mode(TileMode::Auto));
        configs.push(base.clone().with_tile_mode(TileMode::PerFeature));
        configs.push(
            base.clone()
                .with_tile_mode(TileMode::Tiled)
                .with_tile_size(Some(16)),
        );
        configs.push(
            base.clone()
                .with_tile_mode(TileMode::Tiled)
                .with_tile_size(Some(7)),
        );
    }
    configs
}

#[test]
fn test_one_row_per_feature_in_input_order() {
    let sources = fused_sources();
    let crowns = scattered_crowns(40);
    let expected: Vec<&str> = crowns.iter().map(|f| f.id.as_str()).collect();

    for config in all_modes() {
        let table = extract(&sources, &crowns, &config, &CancellationToken::new()).unwrap();
        let ids: Vec<&str> = table.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, expected, "{:?}", config.tile_mode);
        assert_eq!(table.band_labels, vec!["blue", "green", "chm", "lst"]);
        assert!(table.iter().all(|r| r.raster_source == "hsi;chm;thermal"));
    }
}

#[test]
fn test_read_modes_give_identical_results() {
    let sources = fused_sources();
    let configs = all_modes();
    let baseline = run(&sources, &configs[0], 40);

    for config in &configs[1..] {
        let table = run(&sources, config, 40);
        assert_eq!(
            table.records, baseline.records,
            "{:?} with {} worker(s)",
            config.tile_mode, config.concurrency_limit
        );
    }
}

#[test]
fn test_repeated_runs_are_bit_identical() {
    let sources = fused_sources();
    let config = ExtractConfig::default()
        .with_tile_mode(TileMode::Tiled)
        .with_tile_size(Some(10))
        .with_concurrency(4);

    let first = serde_json::to_string(&run(&sources, &config, 25)).unwrap();
    let second = serde_json::to_string(&run(&sources, &config, 25)).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_single_source_statistics() {
    let sources = SourceSet::single(hsi_source()).unwrap();
    // Pixel centres inside: rows 15..20, cols 10..15
    let crowns = collection(vec![square("t1", 10.0, 80.0, 5.0)]);
    let config = ExtractConfig::default().with_statistics(vec![
        Statistic::Mean,
        Statistic::Min,
        Statistic::Max,
        Statistic::Count,
        Statistic::Median,
    ]);

    let table = extract(&sources, &crowns, &config, &CancellationToken::new()).unwrap();
    let record = &table.records[0];
    assert_eq!(record.status, FeatureStatus::Ok);

    let blue = record.band("blue").unwrap();
    assert_eq!(blue.count, 25);
    assert_relative_eq!(blue.mean.unwrap(), 1712.0, epsilon = 1e-9);
    assert_eq!(blue.min, Some(1510.0));
    assert_eq!(blue.max, Some(1914.0));
    assert_relative_eq!(blue.value(&Statistic::Median).unwrap(), 1712.0);

    let green = record.band("green").unwrap();
    assert_relative_eq!(green.mean.unwrap(), 29.0, epsilon = 1e-9);
}

#[test]
fn test_threshold_excludes_low_pixels() {
    let sources = SourceSet::single(hsi_source()).unwrap();
    // green = row + col; rows 15..20, cols 10..15 gives 25..33
    let crowns = collection(vec![square("t1", 10.0, 80.0, 5.0)]);
    let config = ExtractConfig::default().with_threshold(Some(29.0));

    let table = extract(&sources, &crowns, &config, &CancellationToken::new()).unwrap();
    let green = table.records[0].band("green").unwrap();
    // pixels with row + col > 29
    assert_eq!(green.count, 10);
    assert!(green.min.unwrap() > 29.0);
}

#[test]
fn test_raw_values_returned_on_request() {
    let sources = SourceSet::single(hsi_source()).unwrap();
    let crowns = collection(vec![square("t1", 10.0, 80.0, 2.0)]);
    let config = ExtractConfig::default().with_return_raw(true);

    let table = extract(&sources, &crowns, &config, &CancellationToken::new()).unwrap();
    let raw = table.records[0].bands[0].raw.as_ref().unwrap();
    assert_eq!(raw, &vec![1810.0, 1811.0, 1910.0, 1911.0]);
}

#[test]
fn test_attributes_pass_through() {
    use phytostat_core::AttributeValue;

    let sources = SourceSet::single(hsi_source()).unwrap();
    let crowns = collection(vec![
        square("t1", 10.0, 80.0, 5.0).with_property("species", AttributeValue::String("ABBA".into())),
        square("t2", 30.0, 30.0, 5.0),
    ]);

    let table = extract(&sources, &crowns, &ExtractConfig::default(), &CancellationToken::new()).unwrap();
    assert_eq!(table.attribute_names, vec!["species"]);
    assert_eq!(
        table.records[0].attributes.get("species"),
        Some(&AttributeValue::String("ABBA".into()))
    );

    let mut csv = Vec::new();
    table.with_id_column("crown_id").write_csv(&mut csv).unwrap();
    let text = String::from_utf8(csv).unwrap();
    assert!(text.starts_with("crown_id,species,raster_source,status,blue_mean,blue_sd,"));
    assert_eq!(text.lines().count(), 3);
}

#[test]
fn test_out_of_bounds_feature_gets_status_row() {
    let sources = SourceSet::single(hsi_source()).unwrap();
    let crowns = collection(vec![
        square("inside", 10.0, 10.0, 4.0),
        square("outside", 250.0, 250.0, 4.0),
    ]);

    let table = extract(&sources, &crowns, &ExtractConfig::default(), &CancellationToken::new()).unwrap();
    assert_eq!(table.len(), 2);
    assert_eq!(table.records[0].status, FeatureStatus::Ok);

    let outside = table.get("outside").unwrap();
    assert_eq!(outside.status, FeatureStatus::WindowOutOfBounds);
    assert!(outside.bands.iter().all(|b| b.count == 0 && b.mean.is_none()));

    let strict = ExtractConfig::default().with_fail_fast(true);
    let err = extract(&sources, &crowns, &strict, &CancellationToken::new()).unwrap_err();
    assert!(matches!(err, ExtractError::WindowOutOfBounds { id } if id == "outside"));
}

#[test]
fn test_feature_crs_must_match() {
    let sources = SourceSet::single(hsi_source()).unwrap();
    let mut crowns = scattered_crowns(3);
    crowns.crs = CRS::wgs84();

    let err = extract(&sources, &crowns, &ExtractConfig::default(), &CancellationToken::new()).unwrap_err();
    assert!(matches!(err, ExtractError::CrsMismatch { .. }));
}

#[test]
fn test_undeclared_raster_crs_accepts_features() {
    let raster = MemoryRaster::new(Array3::<f32>::from_elem((1, 100, 100), 7.0), fine_transform());
    let sources =
        SourceSet::single(RegisteredSource::new("plain", Arc::new(raster), SourceKind::Passive)).unwrap();
    let mut crowns = scattered_crowns(3);
    crowns.crs = CRS::wgs84();

    let table = extract(&sources, &crowns, &ExtractConfig::default(), &CancellationToken::new()).unwrap();
    assert!(table.iter().all(|r| r.status == FeatureStatus::Ok));
    assert_eq!(table.records[0].bands[0].mean, Some(7.0));
}

#[test]
fn test_duplicate_feature_ids_rejected() {
    let sources = SourceSet::single(hsi_source()).unwrap();
    let crowns = collection(vec![square("t1", 10.0, 10.0, 4.0), square("t1", 30.0, 30.0, 4.0)]);

    let err = extract(&sources, &crowns, &ExtractConfig::default(), &CancellationToken::new()).unwrap_err();
    assert!(matches!(err, ExtractError::DuplicateFeatureId(id) if id == "t1"));
}

#[test]
fn test_invalid_config_rejected() {
    let sources = SourceSet::single(hsi_source()).unwrap();
    let config = ExtractConfig::default().with_concurrency(0);
    let err = extract(&sources, &scattered_crowns(2), &config, &CancellationToken::new()).unwrap_err();
    assert!(matches!(err, ExtractError::InvalidConfig(_)));
}

#[test]
fn test_empty_collection_gives_empty_table() {
    let sources = SourceSet::single(hsi_source()).unwrap();
    let table = extract(&sources, &collection(vec![]), &ExtractConfig::default(), &CancellationToken::new()).unwrap();
    assert!(table.is_empty());
}

#[test]
fn test_plan_switches_to_tiles_under_small_budget() {
    let sources = fused_sources();
    let crowns = scattered_crowns(20);

    let roomy = plan_extraction(&sources, &crowns, &ExtractConfig::default()).unwrap();
    assert_eq!(roomy.strategy, Strategy::WholeRead);
    assert_eq!(roomy.units.len(), 1);

    // about 9 bytes per reference pixel: the whole grid needs ~90 kB
    let tight = ExtractConfig::default()
        .with_memory_budget(20_000)
        .with_concurrency(2);
    let plan = plan_extraction(&sources, &crowns, &tight).unwrap();
    assert!(matches!(plan.strategy, Strategy::Tiled { .. }));
    assert!(plan.units.len() > 1);
    assert_eq!(plan.planned_features(), 20);
}
