use serde::Serialize;

use crate::telemetry::frame::Frame;

/// Entity whose attrs carry causal event markers.
pub const MARKERS_ENTITY: &str = "__markers__";

/// A named zero-duration event and the time it fired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Marker {
    pub name: String,
    pub timestamp: i64,
}

/// Collects markers from `frames`, sorted by timestamp.
///
/// Each attr of the `__markers__` entity is one marker whose `close` holds
/// the fire time in milliseconds. Empty or non-positive values are skipped.
/// Markers with equal timestamps keep their frame/attr order.
pub fn extract_markers(frames: &[Frame]) -> Vec<Marker> {
    let mut markers: Vec<Marker> = frames
        .iter()
        .filter_map(|f| f.entity(MARKERS_ENTITY))
        .flat_map(|rec| rec.attrs.iter())
        .filter_map(|(name, metric)| {
            let close = metric.close()?;
            (close > 0.0).then(|| Marker {
                name: name.clone(),
                timestamp: close as i64,
            })
        })
        .collect();
    // `sort_by_key` is stable.
    markers.sort_by_key(|m| m.timestamp);
    markers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::metric::Metric;

    fn marker_frame(ts: i64, markers: &[(&str, f64)]) -> Frame {
        markers.iter().fold(Frame::new(ts, 100), |f, (name, at)| {
            f.with_attr(MARKERS_ENTITY, name, Metric::from_value(*at))
        })
    }

    #[test]
    fn test_extract_sorted_and_stable() {
        // Attrs within one frame iterate by name, so give each its own frame
        // to pin insertion order.
        let frames = vec![
            marker_frame(0, &[("A", 50.0)]),
            marker_frame(100, &[("B", 10.0)]),
            marker_frame(200, &[("C", 10.0)]),
            marker_frame(300, &[("D", 30.0)]),
        ];
        let got: Vec<(String, i64)> = extract_markers(&frames)
            .into_iter()
            .map(|m| (m.name, m.timestamp))
            .collect();
        assert_eq!(
            got,
            vec![
                ("B".to_string(), 10),
                ("C".to_string(), 10),
                ("D".to_string(), 30),
                ("A".to_string(), 50),
            ]
        );
    }

    #[test]
    fn test_equal_timestamps_keep_frame_order() {
        let frames = vec![
            marker_frame(0, &[("Z_FIRST", 10.0)]),
            marker_frame(100, &[("A_SECOND", 10.0)]),
        ];
        let names: Vec<String> = extract_markers(&frames)
            .into_iter()
            .map(|m| m.name)
            .collect();
        assert_eq!(names, vec!["Z_FIRST", "A_SECOND"]);
    }

    #[test]
    fn test_skips_non_positive_and_empty() {
        let frames = vec![marker_frame(0, &[("zero", 0.0), ("neg", -5.0), ("ok", 7.0)])
            .with_attr(MARKERS_ENTITY, "empty", Metric::empty())];
        let markers = extract_markers(&frames);
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0].name, "ok");
    }

    #[test]
    fn test_no_markers() {
        let frames = vec![Frame::new(0, 100).with_weight("x", Metric::from_value(1.0))];
        assert!(extract_markers(&frames).is_empty());
        assert!(extract_markers(&[]).is_empty());
    }
}
