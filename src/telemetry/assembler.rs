use super::channel::Harvest;
use super::frame::{ElementRecord, Frame, Source};
use super::metric::Metric;

/// Geometry metric name mapped to `ElementRecord::weight`.
pub const WEIGHT_METRIC: &str = "weight";
/// Geometry metric name mapped to `ElementRecord::rank`.
pub const RANK_METRIC: &str = "rank";

/// One harvest cycle across all producers.
#[derive(Debug, Default, Clone)]
pub struct HarvestSet {
    /// Geometry observer output ("dom").
    pub geometry: Harvest,
    /// Logical state signals ("virtual").
    pub logic: Harvest,
    /// Pre-aggregated audio analysis ("audio").
    pub audio: Harvest,
}

impl HarvestSet {
    pub fn is_empty(&self) -> bool {
        self.geometry.is_empty() && self.logic.is_empty() && self.audio.is_empty()
    }
}

/// Merges one harvest cycle into a frame. Returns `None` when nothing was
/// harvested; an empty frame is never produced.
pub fn assemble(timestamp: i64, duration_ms: u64, set: HarvestSet) -> Option<Frame> {
    let mut frame = Frame::new(timestamp, duration_ms);

    if !set.geometry.is_empty() {
        frame.sources.insert(Source::Dom);
    }
    for (entity, metrics) in set.geometry {
        let record = frame.data.entry(entity).or_default();
        for (name, metric) in metrics {
            match name.as_str() {
                WEIGHT_METRIC => record.weight = Some(metric),
                RANK_METRIC => record.rank = Some(metric),
                _ => {
                    record.attrs.insert(name, metric);
                }
            }
        }
    }

    merge_attrs(&mut frame, Source::Virtual, set.logic);
    merge_attrs(&mut frame, Source::Audio, set.audio);

    frame.data.retain(|_, rec: &mut ElementRecord| !rec.is_empty());
    if frame.is_empty() {
        return None;
    }
    Some(frame)
}

fn merge_attrs(frame: &mut Frame, source: Source, harvest: Harvest) {
    if harvest.is_empty() {
        return;
    }
    frame.sources.insert(source);
    for (entity, metrics) in harvest {
        let attrs = &mut frame.data.entry(entity).or_default().attrs;
        for (name, metric) in metrics {
            match attrs.get_mut(&name) {
                // Same key from two producers in one window: keep both ranges.
                Some(existing) => existing.merge_aggregated(&metric),
                None => {
                    attrs.insert(name, metric);
                }
            }
        }
    }
}

/// Convenience for producers that emit a single pre-aggregated value.
pub fn single(entity: &str, name: &str, metric: Metric) -> Harvest {
    let mut h = Harvest::new();
    h.entry(entity.to_string())
        .or_default()
        .insert(name.to_string(), metric);
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assemble_empty_returns_none() {
        assert!(assemble(0, 100, HarvestSet::default()).is_none());
    }

    #[test]
    fn test_assemble_geometry_slots() {
        let mut geometry = single("hero", WEIGHT_METRIC, Metric::from_value(0.5));
        geometry
            .get_mut("hero")
            .expect("hero exists")
            .insert(RANK_METRIC.into(), Metric::from_value(1.0));
        geometry
            .get_mut("hero")
            .expect("hero exists")
            .insert("opacity".into(), Metric::from_value(0.9));

        let frame = assemble(
            1000,
            100,
            HarvestSet {
                geometry,
                ..Default::default()
            },
        )
        .expect("frame");

        assert_eq!(frame.sources, [Source::Dom].into_iter().collect());
        let hero = frame.entity("hero").expect("hero exists");
        assert_eq!(hero.weight.and_then(|m| m.close()), Some(0.5));
        assert_eq!(hero.rank.and_then(|m| m.close()), Some(1.0));
        assert!(hero.attr("opacity").is_some());
    }

    #[test]
    fn test_assemble_merges_shared_entity() {
        let set = HarvestSet {
            geometry: single("ship", WEIGHT_METRIC, Metric::from_value(1.0)),
            logic: single("ship", "thrust", Metric::from_value(7.0)),
            audio: Harvest::new(),
        };
        let frame = assemble(0, 100, set).expect("frame");

        assert_eq!(
            frame.sources,
            [Source::Dom, Source::Virtual].into_iter().collect()
        );
        assert_eq!(frame.data.len(), 1);
        let ship = frame.entity("ship").expect("ship exists");
        assert!(ship.weight.is_some());
        assert_eq!(ship.attr("thrust").and_then(|m| m.close()), Some(7.0));
    }

    #[test]
    fn test_assemble_audio_only() {
        let set = HarvestSet {
            audio: single(
                "__system__/audio",
                "peak_level",
                Metric::from_ohlc(0.0, 0.7, 0.0, 0.1, 6),
            ),
            ..Default::default()
        };
        let frame = assemble(5, 100, set).expect("frame");
        assert_eq!(frame.sources, [Source::Audio].into_iter().collect());
        let peak = frame
            .entity("__system__/audio")
            .and_then(|r| r.attr("peak_level"))
            .expect("peak exists");
        assert_eq!(peak.high(), Some(0.7));
    }

    #[test]
    fn test_assemble_same_attr_from_two_producers() {
        let set = HarvestSet {
            logic: single("x", "v", Metric::from_ohlc(1.0, 2.0, 1.0, 2.0, 1)),
            audio: single("x", "v", Metric::from_ohlc(0.0, 0.5, -1.0, 0.3, 1)),
            ..Default::default()
        };
        let frame = assemble(0, 100, set).expect("frame");
        let v = frame.entity("x").and_then(|r| r.attr("v")).expect("v exists");
        assert_eq!(v.high(), Some(2.0));
        assert_eq!(v.low(), Some(-1.0));
        assert_eq!(v.close(), Some(0.3));
    }
}
