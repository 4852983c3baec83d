use std::collections::HashMap;
use std::sync::Arc;

use montage_media::error::{Error, Result};
use montage_media::frame::{AlphaMat, Blender, CpuBlender, ImageMat, PcmBuf};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

pub const FILTER_NAME: &str = "EventStackFilter";

/// Processing-graph runtime attached to every event. The engine only
/// drives it: curve values go in through named inputs, frames and PCM go
/// through `run_*`.
pub trait FilterGraph: Send {
    fn is_executable(&self) -> bool;

    fn set_input(&mut self, name: &str, value: f64);

    fn run_image(&mut self, input: &ImageMat, pos: i64, length: i64) -> ImageMat;

    fn run_pcm(&mut self, input: &PcmBuf, pos: i64, length: i64) -> PcmBuf;

    /// Serialized form; the source of truth for persistence.
    fn save_json(&self) -> Value;
}

/// Builds graphs for new events and revives them from their serialized
/// form on load.
pub trait GraphFactory: Send + Sync {
    fn new_graph(&self) -> Box<dyn FilterGraph>;

    fn load(&self, json: &Value) -> Result<Box<dyn FilterGraph>>;
}

/// Turns a mask description into a coverage plane.
pub trait MaskMaterializer: Send + Sync {
    fn materialize(&self, json: &Value) -> Option<AlphaMat>;
}

/// One key point of a named curve: clip-local millisecond and value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KeyPoint {
    pub t: i64,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Curve {
    pub name: String,
    pub points: Vec<KeyPoint>,
}

/// Named numeric curves over the domain `[0, length]`, linearly
/// interpolated and clamped at the ends. Changing an event's range
/// rescales the domain proportionally.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CurveSet {
    length: i64,
    curves: Vec<Curve>,
}

impl CurveSet {
    pub fn new(length: i64) -> Self {
        Self {
            length: length.max(0),
            curves: Vec::new(),
        }
    }

    pub fn length(&self) -> i64 {
        self.length
    }

    pub fn curves(&self) -> &[Curve] {
        &self.curves
    }

    /// Installs (or replaces) a curve; points are sorted and clamped into
    /// the domain.
    pub fn set_curve(&mut self, name: &str, mut points: Vec<KeyPoint>) {
        points.sort_by_key(|p| p.t);
        for point in &mut points {
            point.t = point.t.clamp(0, self.length);
        }
        match self.curves.iter_mut().find(|c| c.name == name) {
            Some(curve) => curve.points = points,
            None => self.curves.push(Curve {
                name: name.to_string(),
                points,
            }),
        }
    }

    pub fn remove_curve(&mut self, name: &str) {
        self.curves.retain(|c| c.name != name);
    }

    /// Samples a curve at `t`, clamped to its end points.
    pub fn value(&self, name: &str, t: i64) -> Option<f64> {
        let curve = self.curves.iter().find(|c| c.name == name)?;
        let points = &curve.points;
        let first = points.first()?;
        let last = points.last()?;
        if t <= first.t {
            return Some(first.value);
        }
        if t >= last.t {
            return Some(last.value);
        }
        let after = points.iter().position(|p| p.t > t)?;
        let (a, b) = (points[after - 1], points[after]);
        if b.t == a.t {
            return Some(b.value);
        }
        let frac = (t - a.t) as f64 / (b.t - a.t) as f64;
        Some(a.value + (b.value - a.value) * frac)
    }

    /// Stretches every point proportionally into the new domain.
    pub fn rescale_domain(&mut self, new_length: i64) {
        let new_length = new_length.max(0);
        if self.length > 0 && new_length != self.length {
            for curve in &mut self.curves {
                for point in &mut curve.points {
                    point.t = point.t * new_length / self.length;
                }
            }
        }
        self.length = new_length;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackKind {
    Video,
    Audio,
}

/// A time-scoped effect on a clip: a range, a z layer, a processing graph
/// driven by key-point curves, and (for video) masks confining where the
/// effect applies.
pub struct Event {
    id: i64,
    start: i64,
    end: i64,
    z: i32,
    status: u32,
    graph: Box<dyn FilterGraph>,
    curves: CurveSet,
    event_masks: Vec<Value>,
    materialized_masks: Vec<AlphaMat>,
    effect_mask_table: HashMap<i64, Vec<Value>>,
}

impl Event {
    fn new(id: i64, start: i64, end: i64, z: i32, graph: Box<dyn FilterGraph>) -> Self {
        Self {
            id,
            start,
            end,
            z,
            status: 0,
            graph,
            curves: CurveSet::new(end - start),
            event_masks: Vec::new(),
            materialized_masks: Vec::new(),
            effect_mask_table: HashMap::new(),
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn start(&self) -> i64 {
        self.start
    }

    pub fn end(&self) -> i64 {
        self.end
    }

    pub fn length(&self) -> i64 {
        self.end - self.start
    }

    pub fn z(&self) -> i32 {
        self.z
    }

    pub fn status(&self) -> u32 {
        self.status
    }

    pub fn set_status(&mut self, status: u32) {
        self.status = status;
    }

    pub fn set_status_bit(&mut self, bit: u32, value: bool) {
        if value {
            self.status |= 1 << bit;
        } else {
            self.status &= !(1 << bit);
        }
    }

    pub fn is_in_range(&self, pos: i64) -> bool {
        pos >= self.start && pos < self.end
    }

    pub fn curves(&self) -> &CurveSet {
        &self.curves
    }

    pub fn curves_mut(&mut self) -> &mut CurveSet {
        &mut self.curves
    }

    pub fn mask_count(&self) -> usize {
        self.event_masks.len()
    }

    pub fn node_mask_count(&self, node_id: i64) -> usize {
        self.effect_mask_table
            .get(&node_id)
            .map(|m| m.len())
            .unwrap_or(0)
    }

    fn push_curve_inputs(&mut self, local_pos: i64) {
        for curve in self.curves.curves() {
            if let Some(value) = self.curves.value(&curve.name, local_pos) {
                self.graph.set_input(&curve.name, value);
            }
        }
    }

    /// Runs the graph on `input` at a clip-local position, then confines
    /// the effect to the union of the event masks.
    fn filter_image(&mut self, input: &ImageMat, local_pos: i64, blender: &dyn Blender) -> ImageMat {
        if !self.graph.is_executable() {
            return input.clone();
        }
        self.push_curve_inputs(local_pos);
        let mut out = self.graph.run_image(input, local_pos, self.length());

        if !self.materialized_masks.is_empty() {
            let mut combined = self.materialized_masks[0].clone();
            for mask in &self.materialized_masks[1..] {
                combined.max_in_place(mask);
            }
            out = blender.blend(&out, input, &combined);
        }
        out
    }

    fn filter_pcm(&mut self, input: &PcmBuf, local_pos: i64) -> PcmBuf {
        if !self.graph.is_executable() {
            return input.clone();
        }
        self.push_curve_inputs(local_pos);
        self.graph.run_pcm(input, local_pos, self.length())
    }

    fn save_as_json(&self, kind: StackKind) -> Value {
        let mut event_json = json!({
            "id": self.id,
            "start": self.start,
            "end": self.end,
            "z": self.z,
            "bp": self.graph.save_json(),
            "kp": serde_json::to_value(&self.curves).unwrap_or(Value::Null),
        });
        if kind == StackKind::Video {
            event_json["event_masks"] = Value::Array(self.event_masks.clone());
            let mut table = Vec::new();
            let mut node_ids: Vec<i64> = self.effect_mask_table.keys().copied().collect();
            node_ids.sort_unstable();
            for node_id in node_ids {
                table.push(json!({
                    "node_id": node_id,
                    "masks": self.effect_mask_table[&node_id].clone(),
                }));
            }
            event_json["effect_mask_table"] = Value::Array(table);
        }
        event_json
    }
}

/// Per-clip ordered list of events, sorted by `(start, z)`. Events on the
/// same z layer may not overlap in time.
pub struct EventStack {
    kind: StackKind,
    events: Vec<Event>,
    editing_event_id: i64,
    factory: Arc<dyn GraphFactory>,
    materializer: Option<Arc<dyn MaskMaterializer>>,
    blender: Arc<dyn Blender>,
}

impl EventStack {
    pub fn new_video(
        factory: Arc<dyn GraphFactory>,
        materializer: Arc<dyn MaskMaterializer>,
    ) -> Self {
        Self {
            kind: StackKind::Video,
            events: Vec::new(),
            editing_event_id: -1,
            factory,
            materializer: Some(materializer),
            blender: Arc::new(CpuBlender),
        }
    }

    pub fn new_audio(factory: Arc<dyn GraphFactory>) -> Self {
        Self {
            kind: StackKind::Audio,
            events: Vec::new(),
            editing_event_id: -1,
            factory,
            materializer: None,
            blender: Arc::new(CpuBlender),
        }
    }

    pub fn set_blender(&mut self, blender: Arc<dyn Blender>) {
        self.blender = blender;
    }

    pub fn kind(&self) -> StackKind {
        self.kind
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn event(&self, id: i64) -> Option<&Event> {
        self.events.iter().find(|e| e.id == id)
    }

    pub fn event_mut(&mut self, id: i64) -> Option<&mut Event> {
        self.events.iter_mut().find(|e| e.id == id)
    }

    pub fn events_by_z(&self, z: i32) -> Vec<&Event> {
        self.events.iter().filter(|e| e.z == z).collect()
    }

    /// Adds an event. The range is normalized so `start < end`; the id
    /// must be fresh and the range free on its z layer.
    pub fn add_new_event(&mut self, id: i64, start: i64, end: i64, z: i32) -> Result<i64> {
        let (start, end) = normalize_range(start, end)?;
        if self.event(id).is_some() {
            return Err(Error::AlreadyExists(format!("event {id}")));
        }
        if self.conflicts(id, start, end, z) {
            warn!(id, start, end, z, "event add rejected: z-layer conflict");
            return Err(Error::invalid_range(format!(
                "event range [{start}, {end}) overlaps an existing event on z {z}"
            )));
        }

        crate::ids::observe_id(id);
        let event = Event::new(id, start, end, z, self.factory.new_graph());
        debug!(id, start, end, z, "event added");
        self.events.push(event);
        self.sort_events();
        Ok(id)
    }

    pub fn remove_event(&mut self, id: i64) -> Result<()> {
        let index = self
            .events
            .iter()
            .position(|e| e.id == id)
            .ok_or_else(|| Error::not_found(format!("event {id}")))?;
        self.events.remove(index);
        if self.editing_event_id == id {
            self.editing_event_id = -1;
        }
        Ok(())
    }

    /// Re-ranges an event and rescales its curve domain to the new length.
    pub fn change_event_range(&mut self, id: i64, start: i64, end: i64) -> Result<()> {
        let (start, end) = normalize_range(start, end)?;
        let z = self
            .event(id)
            .map(|e| e.z)
            .ok_or_else(|| Error::not_found(format!("event {id}")))?;
        if self.conflicts(id, start, end, z) {
            return Err(Error::invalid_range(format!(
                "event range [{start}, {end}) overlaps an existing event on z {z}"
            )));
        }

        let event = self
            .event_mut(id)
            .ok_or_else(|| Error::not_found(format!("event {id}")))?;
        event.start = start;
        event.end = end;
        event.curves.rescale_domain(end - start);
        self.sort_events();
        Ok(())
    }

    /// Moves an event (and optionally re-layers it) keeping its length.
    pub fn move_event(&mut self, id: i64, new_start: i64, z: i32) -> Result<()> {
        let (start, end) = {
            let event = self
                .event(id)
                .ok_or_else(|| Error::not_found(format!("event {id}")))?;
            (new_start, event.end + (new_start - event.start))
        };
        if self.conflicts(id, start, end, z) {
            return Err(Error::invalid_range(format!(
                "event range [{start}, {end}) overlaps an existing event on z {z}"
            )));
        }

        let event = self
            .event_mut(id)
            .ok_or_else(|| Error::not_found(format!("event {id}")))?;
        event.start = start;
        event.end = end;
        event.z = z;
        self.sort_events();
        Ok(())
    }

    /// Shifts every event by `offset` without validation; callers keep
    /// the result inside the timeline.
    pub fn move_all_events(&mut self, offset: i64) {
        for event in &mut self.events {
            event.start += offset;
            event.end += offset;
        }
    }

    /// Transient selection; `-1` clears it.
    pub fn set_editing_event(&mut self, id: i64) -> Result<()> {
        if id != -1 && self.event(id).is_none() {
            return Err(Error::not_found(format!("event {id}")));
        }
        self.editing_event_id = id;
        Ok(())
    }

    pub fn editing_event(&self) -> Option<&Event> {
        self.event(self.editing_event_id)
    }

    /// Runs every event covering `pos` (in `(start, z)` order) over the
    /// input image.
    pub fn filter_image(&mut self, input: &ImageMat, pos: i64) -> ImageMat {
        let blender = self.blender.clone();
        let mut out = input.clone();
        for event in self.events.iter_mut().filter(|e| e.is_in_range(pos)) {
            let local = pos - event.start;
            out = event.filter_image(&out, local, blender.as_ref());
        }
        out
    }

    /// Audio counterpart; no mask layer.
    pub fn filter_pcm(&mut self, input: &PcmBuf, pos: i64, _duration: i64) -> PcmBuf {
        let mut out = input.clone();
        for event in self.events.iter_mut().filter(|e| e.is_in_range(pos)) {
            let local = pos - event.start;
            out = event.filter_pcm(&out, local);
        }
        out
    }

    pub fn event_mask(&self, event_id: i64, index: usize) -> Result<&Value> {
        let event = self
            .event(event_id)
            .ok_or_else(|| Error::not_found(format!("event {event_id}")))?;
        event.event_masks.get(index).ok_or_else(|| {
            Error::invalid_argument(format!(
                "event {event_id} has only {} masks, cannot get mask {index}",
                event.event_masks.len()
            ))
        })
    }

    /// Stores (or replaces, when `index` names an existing slot) an event
    /// mask and materializes its coverage plane.
    pub fn save_event_mask(
        &mut self,
        event_id: i64,
        mask_json: Value,
        index: Option<usize>,
    ) -> Result<()> {
        if self.kind != StackKind::Video {
            return Err(Error::InvalidState(
                "audio events carry no masks".to_string(),
            ));
        }
        let materializer = self
            .materializer
            .clone()
            .ok_or_else(|| Error::InvalidState("no mask materializer installed".to_string()))?;
        let event = self
            .event_mut(event_id)
            .ok_or_else(|| Error::not_found(format!("event {event_id}")))?;

        let mat = materializer.materialize(&mask_json).ok_or_else(|| {
            Error::ParseFailed("mask json could not be materialized".to_string())
        })?;
        match index {
            None => {
                event.event_masks.push(mask_json);
                event.materialized_masks.push(mat);
            }
            Some(i) if i < event.event_masks.len() => {
                event.event_masks[i] = mask_json;
                event.materialized_masks[i] = mat;
            }
            Some(i) if i == event.event_masks.len() => {
                event.event_masks.push(mask_json);
                event.materialized_masks.push(mat);
            }
            Some(i) => {
                return Err(Error::invalid_argument(format!(
                    "event {event_id} has only {} masks, cannot save mask at {i}",
                    event.event_masks.len()
                )));
            }
        }
        Ok(())
    }

    pub fn remove_event_mask(&mut self, event_id: i64, index: usize) -> Result<()> {
        let event = self
            .event_mut(event_id)
            .ok_or_else(|| Error::not_found(format!("event {event_id}")))?;
        if index >= event.event_masks.len() {
            return Err(Error::invalid_argument(format!(
                "event {event_id} has only {} masks, cannot remove mask {index}",
                event.event_masks.len()
            )));
        }
        event.event_masks.remove(index);
        event.materialized_masks.remove(index);
        Ok(())
    }

    pub fn node_mask(&self, event_id: i64, node_id: i64, index: usize) -> Result<&Value> {
        let event = self
            .event(event_id)
            .ok_or_else(|| Error::not_found(format!("event {event_id}")))?;
        let masks = event
            .effect_mask_table
            .get(&node_id)
            .ok_or_else(|| Error::not_found(format!("no masks for node {node_id}")))?;
        masks.get(index).ok_or_else(|| {
            Error::invalid_argument(format!(
                "node {node_id} has only {} masks, cannot get mask {index}",
                masks.len()
            ))
        })
    }

    /// Stores a per-node mask (consumed by graph nodes that reference a
    /// mask index; never materialized here).
    pub fn save_node_mask(
        &mut self,
        event_id: i64,
        node_id: i64,
        mask_json: Value,
        index: Option<usize>,
    ) -> Result<()> {
        if self.kind != StackKind::Video {
            return Err(Error::InvalidState(
                "audio events carry no masks".to_string(),
            ));
        }
        let event = self
            .event_mut(event_id)
            .ok_or_else(|| Error::not_found(format!("event {event_id}")))?;
        let masks = event.effect_mask_table.entry(node_id).or_default();
        match index {
            None => masks.push(mask_json),
            Some(i) if i < masks.len() => masks[i] = mask_json,
            Some(i) if i == masks.len() => masks.push(mask_json),
            Some(i) => {
                return Err(Error::invalid_argument(format!(
                    "node {node_id} has only {} masks, cannot save mask at {i}",
                    masks.len()
                )));
            }
        }
        Ok(())
    }

    pub fn remove_node_mask(&mut self, event_id: i64, node_id: i64, index: usize) -> Result<()> {
        let event = self
            .event_mut(event_id)
            .ok_or_else(|| Error::not_found(format!("event {event_id}")))?;
        let masks = event
            .effect_mask_table
            .get_mut(&node_id)
            .ok_or_else(|| Error::not_found(format!("no masks for node {node_id}")))?;
        if index >= masks.len() {
            return Err(Error::invalid_argument(format!(
                "node {node_id} has only {} masks, cannot remove mask {index}",
                masks.len()
            )));
        }
        masks.remove(index);
        Ok(())
    }

    pub fn save_as_json(&self) -> Value {
        let events: Vec<Value> = self.events.iter().map(|e| e.save_as_json(self.kind)).collect();
        json!({
            "name": FILTER_NAME,
            "events": events,
        })
    }

    pub fn video_from_json(
        filter_json: &Value,
        factory: Arc<dyn GraphFactory>,
        materializer: Arc<dyn MaskMaterializer>,
    ) -> Result<Self> {
        let mut stack = Self::new_video(factory, materializer);
        stack.load_events(filter_json)?;
        Ok(stack)
    }

    pub fn audio_from_json(filter_json: &Value, factory: Arc<dyn GraphFactory>) -> Result<Self> {
        let mut stack = Self::new_audio(factory);
        stack.load_events(filter_json)?;
        Ok(stack)
    }

    /// Parses one serialized event and enrolls it under the usual
    /// duplicate-id and z-layer rules.
    pub fn restore_event_from_json(&mut self, event_json: &Value) -> Result<i64> {
        let event = self.parse_event(event_json)?;
        self.enroll(event)
    }

    fn load_events(&mut self, filter_json: &Value) -> Result<()> {
        let name = filter_json
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::ParseFailed("filter json is missing 'name'".to_string()))?;
        if name != FILTER_NAME {
            return Err(Error::ParseFailed(format!(
                "'{name}' is not an event stack filter"
            )));
        }
        if let Some(events) = filter_json.get("events").and_then(Value::as_array) {
            for event_json in events {
                let event = self.parse_event(event_json)?;
                self.enroll(event)?;
            }
        }
        Ok(())
    }

    fn enroll(&mut self, event: Event) -> Result<i64> {
        if self.event(event.id).is_some() {
            return Err(Error::AlreadyExists(format!("event {}", event.id)));
        }
        if self.conflicts(event.id, event.start, event.end, event.z) {
            return Err(Error::invalid_range(format!(
                "event range [{}, {}) overlaps an existing event on z {}",
                event.start, event.end, event.z
            )));
        }
        crate::ids::observe_id(event.id);
        let id = event.id;
        self.events.push(event);
        self.sort_events();
        Ok(id)
    }

    fn parse_event(&self, event_json: &Value) -> Result<Event> {
        let field = |name: &str| -> Result<i64> {
            event_json.get(name).and_then(Value::as_i64).ok_or_else(|| {
                Error::ParseFailed(format!("event json is missing '{name}'"))
            })
        };
        let id = field("id")?;
        let start = field("start")?;
        let end = field("end")?;
        let z = field("z")? as i32;

        let graph_json = event_json
            .get("bp")
            .ok_or_else(|| Error::ParseFailed("event json is missing 'bp'".to_string()))?;
        let graph = self.factory.load(graph_json)?;

        let curves_json = event_json
            .get("kp")
            .ok_or_else(|| Error::ParseFailed("event json is missing 'kp'".to_string()))?;
        let mut curves: CurveSet = serde_json::from_value(curves_json.clone())
            .map_err(|e| Error::ParseFailed(format!("bad curve json: {e}")))?;
        curves.rescale_domain(end - start);

        let mut event = Event::new(id, start, end, z, graph);
        event.curves = curves;

        if self.kind == StackKind::Video {
            if let Some(masks) = event_json.get("event_masks").and_then(Value::as_array) {
                for mask_json in masks {
                    if let Some(mat) = self
                        .materializer
                        .as_ref()
                        .and_then(|m| m.materialize(mask_json))
                    {
                        event.event_masks.push(mask_json.clone());
                        event.materialized_masks.push(mat);
                    }
                }
            }
            if let Some(table) = event_json.get("effect_mask_table").and_then(Value::as_array) {
                for entry in table {
                    let Some(node_id) = entry.get("node_id").and_then(Value::as_i64) else {
                        continue;
                    };
                    let masks = entry
                        .get("masks")
                        .and_then(Value::as_array)
                        .cloned()
                        .unwrap_or_default();
                    event.effect_mask_table.insert(node_id, masks);
                }
            }
        }

        Ok(event)
    }

    fn conflicts(&self, skip_id: i64, start: i64, end: i64, z: i32) -> bool {
        self.events
            .iter()
            .any(|e| e.id != skip_id && e.z == z && start < e.end && e.start < end)
    }

    fn sort_events(&mut self) {
        self.events.sort_by_key(|e| (e.start, e.z));
    }
}

fn normalize_range(start: i64, end: i64) -> Result<(i64, i64)> {
    if start == end {
        return Err(Error::invalid_argument(
            "event start and end cannot be identical",
        ));
    }
    Ok(if end < start { (end, start) } else { (start, end) })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use image::{Rgba, RgbaImage};
    use montage_media::error::Error;
    use montage_media::frame::{AlphaMat, ImageMat, PcmBuf};
    use serde_json::{Value, json};

    use super::{
        CurveSet, EventStack, FilterGraph, GraphFactory, KeyPoint, MaskMaterializer,
    };

    /// Paints the whole frame with a constant value; `run_pcm` scales
    /// samples by the last "gain" input.
    struct ConstGraph {
        value: u8,
        gain: f64,
    }

    impl FilterGraph for ConstGraph {
        fn is_executable(&self) -> bool {
            true
        }

        fn set_input(&mut self, name: &str, value: f64) {
            if name == "gain" {
                self.gain = value;
            }
        }

        fn run_image(&mut self, input: &ImageMat, _pos: i64, _length: i64) -> ImageMat {
            let Some(img) = input.image() else {
                return input.clone();
            };
            ImageMat::from_image(
                RgbaImage::from_pixel(
                    img.width(),
                    img.height(),
                    Rgba([self.value, self.value, self.value, 255]),
                ),
                input.timestamp,
            )
        }

        fn run_pcm(&mut self, input: &PcmBuf, _pos: i64, _length: i64) -> PcmBuf {
            let mut out = input.clone();
            for sample in &mut out.samples {
                *sample *= self.gain as f32;
            }
            out
        }

        fn save_json(&self) -> Value {
            json!({ "kind": "const", "value": self.value })
        }
    }

    struct TestFactory;

    impl GraphFactory for TestFactory {
        fn new_graph(&self) -> Box<dyn FilterGraph> {
            Box::new(ConstGraph { value: 0, gain: 1.0 })
        }

        fn load(&self, json: &Value) -> montage_media::Result<Box<dyn FilterGraph>> {
            let value = json.get("value").and_then(Value::as_u64).unwrap_or(0) as u8;
            Ok(Box::new(ConstGraph { value, gain: 1.0 }))
        }
    }

    /// `{"shape": "circle", "size": n, "cx": x, "cy": y, "r": r}` →
    /// hard-edged circular coverage.
    struct CircleMasks;

    impl MaskMaterializer for CircleMasks {
        fn materialize(&self, json: &Value) -> Option<AlphaMat> {
            if json.get("shape").and_then(Value::as_str) != Some("circle") {
                return None;
            }
            let size = json.get("size")?.as_u64()? as u32;
            let cx = json.get("cx")?.as_f64()?;
            let cy = json.get("cy")?.as_f64()?;
            let r = json.get("r")?.as_f64()?;
            Some(AlphaMat::from_fn(size, size, |x, y| {
                let dx = x as f64 - cx;
                let dy = y as f64 - cy;
                if (dx * dx + dy * dy).sqrt() <= r { 1.0 } else { 0.0 }
            }))
        }
    }

    fn video_stack() -> EventStack {
        EventStack::new_video(Arc::new(TestFactory), Arc::new(CircleMasks))
    }

    fn gray(size: u32, level: u8) -> ImageMat {
        ImageMat::from_image(
            RgbaImage::from_pixel(size, size, Rgba([level, level, level, 255])),
            0.0,
        )
    }

    #[test]
    fn same_z_overlap_is_rejected_other_z_is_fine() {
        let mut stack = video_stack();
        stack.add_new_event(1, 0, 1000, 0).expect("add");
        let clash = stack.add_new_event(2, 500, 1500, 0);
        assert!(matches!(clash, Err(Error::InvalidRange(_))));
        stack.add_new_event(3, 500, 1500, 1).expect("other layer");
        assert_eq!(stack.events().len(), 2);
    }

    #[test]
    fn reversed_range_is_normalized() {
        let mut stack = video_stack();
        stack.add_new_event(1, 1000, 200, 0).expect("add");
        let event = stack.event(1).expect("present");
        assert_eq!((event.start(), event.end()), (200, 1000));
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let mut stack = video_stack();
        stack.add_new_event(1, 0, 100, 0).expect("add");
        assert!(matches!(
            stack.add_new_event(1, 200, 300, 0),
            Err(Error::AlreadyExists(_))
        ));
    }

    #[test]
    fn degenerate_range_is_rejected() {
        let mut stack = video_stack();
        assert!(stack.add_new_event(1, 100, 100, 0).is_err());
    }

    #[test]
    fn change_range_rescales_curve_domain() {
        let mut stack = video_stack();
        stack.add_new_event(1, 0, 1000, 0).expect("add");
        stack
            .event_mut(1)
            .expect("present")
            .curves_mut()
            .set_curve(
                "gain",
                vec![
                    KeyPoint { t: 0, value: 0.0 },
                    KeyPoint { t: 1000, value: 1.0 },
                ],
            );

        stack.change_event_range(1, 0, 500).expect("shrink");
        let curves = stack.event(1).expect("present").curves();
        assert_eq!(curves.length(), 500);
        assert_eq!(curves.value("gain", 500), Some(1.0));
        assert_eq!(curves.value("gain", 250), Some(0.5));
    }

    #[test]
    fn move_event_keeps_length_and_changes_layer() {
        let mut stack = video_stack();
        stack.add_new_event(1, 100, 400, 0).expect("add");
        stack.move_event(1, 700, 2).expect("move");
        let event = stack.event(1).expect("present");
        assert_eq!((event.start(), event.end(), event.z()), (700, 1000, 2));
    }

    #[test]
    fn move_all_events_shifts_without_validation() {
        let mut stack = video_stack();
        stack.add_new_event(1, 100, 200, 0).expect("add");
        stack.add_new_event(2, 300, 400, 0).expect("add");
        stack.move_all_events(-150);
        assert_eq!(stack.event(1).expect("present").start(), -50);
        assert_eq!(stack.event(2).expect("present").end(), 250);
    }

    #[test]
    fn editing_event_selection() {
        let mut stack = video_stack();
        stack.add_new_event(1, 0, 100, 0).expect("add");
        assert!(stack.set_editing_event(9).is_err());
        stack.set_editing_event(1).expect("select");
        assert_eq!(stack.editing_event().map(|e| e.id()), Some(1));
        stack.set_editing_event(-1).expect("clear");
        assert!(stack.editing_event().is_none());
    }

    #[test]
    fn filter_outside_event_range_returns_input() {
        let mut stack = video_stack();
        stack.add_new_event(1, 500, 1500, 0).expect("add");
        let input = gray(20, 200);
        let out = stack.filter_image(&input, 200);
        assert_eq!(
            out.image().expect("pixels").get_pixel(10, 10).0,
            [200, 200, 200, 255]
        );
    }

    #[test]
    fn masked_zero_graph_zeroes_inside_circle_only() {
        let mut stack = video_stack();
        stack.add_new_event(1, 500, 1500, 0).expect("add");
        // frame 20x20, circle radius 10% of frame size at the center
        stack
            .save_event_mask(
                1,
                json!({ "shape": "circle", "size": 20, "cx": 10.0, "cy": 10.0, "r": 2.0 }),
                None,
            )
            .expect("mask");

        let input = gray(20, 200);
        let out = stack.filter_image(&input, 1000);
        let img = out.image().expect("pixels");
        assert_eq!(img.get_pixel(10, 10).0, [0, 0, 0, 255]);
        assert_eq!(img.get_pixel(0, 0).0, [200, 200, 200, 255]);
    }

    #[test]
    fn filter_pcm_applies_curve_gain() {
        let mut stack = EventStack::new_audio(Arc::new(TestFactory));
        stack.add_new_event(1, 0, 1000, 0).expect("add");
        stack
            .event_mut(1)
            .expect("present")
            .curves_mut()
            .set_curve(
                "gain",
                vec![
                    KeyPoint { t: 0, value: 0.0 },
                    KeyPoint { t: 1000, value: 1.0 },
                ],
            );

        let input = PcmBuf {
            samples: vec![1.0, 1.0],
            channels: 2,
            sample_rate: 48_000,
            timestamp_ms: 0,
        };
        let out = stack.filter_pcm(&input, 500, 10);
        assert!((out.samples[0] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn save_load_round_trip_preserves_events() {
        let mut stack = video_stack();
        stack.add_new_event(7, 100, 600, 1).expect("add");
        stack.add_new_event(3, 800, 900, 0).expect("add");
        stack
            .event_mut(7)
            .expect("present")
            .curves_mut()
            .set_curve("gain", vec![KeyPoint { t: 0, value: 0.25 }]);
        stack
            .save_event_mask(
                7,
                json!({ "shape": "circle", "size": 8, "cx": 4.0, "cy": 4.0, "r": 2.0 }),
                None,
            )
            .expect("mask");
        stack
            .save_node_mask(
                7,
                42,
                json!({ "shape": "circle", "size": 8, "cx": 1.0, "cy": 1.0, "r": 1.0 }),
                None,
            )
            .expect("node mask");

        let saved = stack.save_as_json();
        let restored =
            EventStack::video_from_json(&saved, Arc::new(TestFactory), Arc::new(CircleMasks))
                .expect("load");

        assert_eq!(restored.events().len(), 2);
        let event = restored.event(7).expect("present");
        assert_eq!((event.start(), event.end(), event.z()), (100, 600, 1));
        assert_eq!(event.curves().value("gain", 0), Some(0.25));
        assert_eq!(event.mask_count(), 1);
        assert_eq!(event.node_mask_count(42), 1);
        assert_eq!(restored.save_as_json(), saved);
    }

    #[test]
    fn restore_event_rejects_layer_conflict() {
        let mut stack = video_stack();
        stack.add_new_event(1, 0, 1000, 0).expect("add");
        let saved = stack.save_as_json();
        let event_json = saved["events"][0].clone();

        let mut other = video_stack();
        other.add_new_event(2, 500, 700, 0).expect("add");
        assert!(other.restore_event_from_json(&event_json).is_err());
    }

    #[test]
    fn curve_clamps_outside_domain() {
        let mut curves = CurveSet::new(1000);
        curves.set_curve(
            "x",
            vec![
                KeyPoint { t: 200, value: 2.0 },
                KeyPoint { t: 800, value: 4.0 },
            ],
        );
        assert_eq!(curves.value("x", 0), Some(2.0));
        assert_eq!(curves.value("x", 1000), Some(4.0));
        assert_eq!(curves.value("x", 500), Some(3.0));
        assert_eq!(curves.value("missing", 0), None);
    }
}
