use std::collections::HashMap;
use std::fmt::{self, Display, Formatter, Write};
use std::time::{Duration, Instant};

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::engine::registry::Registry;
use crate::engine::{TaskId, TaskType};

/// When a task body started and how long it ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskExecution {
    pub start: Instant,
    pub duration: Duration,
}

impl TaskExecution {
    pub fn end(&self) -> Instant {
        self.start + self.duration
    }
}

/// A slot as seen by [`DependencyGraph`].
#[derive(Debug, Clone)]
pub struct GraphNode {
    pub id: TaskId,
    pub name: String,
    pub task_type: TaskType,
    /// Outstanding references at the time of the snapshot.
    pub references: u32,
    pub released: bool,
}

/// Snapshot of the wired graph of the current frame.
///
/// Edges point from a task to the tasks waiting on it, so a topological order
/// is a valid execution order.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    graph: DiGraph<GraphNode, ()>,
}

impl DependencyGraph {
    pub(crate) fn capture(registry: &Registry) -> Self {
        let edges = registry.rows.iter().map(|row| row.dependents.len()).sum();
        let mut graph = DiGraph::with_capacity(registry.rows.len(), edges);

        for (index, row) in registry.rows.iter().enumerate() {
            graph.add_node(GraphNode {
                id: registry.id(index),
                name: registry.label(index),
                task_type: row.slot.kind(),
                references: row.slot.references(),
                released: row.slot.is_released(),
            });
        }

        // Node indices follow slot indices.
        for (index, row) in registry.rows.iter().enumerate() {
            for &dependent in &row.dependents {
                graph.add_edge(NodeIndex::new(index), NodeIndex::new(dependent), ());
            }
        }

        Self { graph }
    }

    pub fn graph(&self) -> &DiGraph<GraphNode, ()> {
        &self.graph
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn node(&self, id: TaskId) -> Option<&GraphNode> {
        self.graph.node_weights().find(|node| node.id == id)
    }

    /// Tasks that wait on `id`.
    pub fn successors(&self, id: TaskId) -> Vec<TaskId> {
        let Some(index) = self.graph.node_indices().find(|&i| self.graph[i].id == id) else {
            return Vec::new();
        };

        self.graph
            .neighbors(index)
            .map(|next| self.graph[next].id)
            .collect()
    }

    /// A valid execution order, or a task that sits on a dependency cycle.
    pub fn topological_order(&self) -> Result<Vec<TaskId>, TaskId> {
        toposort(&self.graph, None)
            .map(|order| order.into_iter().map(|i| self.graph[i].id).collect())
            .map_err(|cycle| self.graph[cycle.node_id()].id)
    }
}

fn type_label(kind: TaskType) -> &'static str {
    match kind {
        TaskType::Cpu => "CPU",
        TaskType::Gpu => "GPU",
        TaskType::NotPresent => "not present",
        TaskType::Completed => "completed",
    }
}

fn escape(name: &str) -> String {
    name.replace('"', "\\\"")
}

/// Renders the graph as a Mermaid flowchart.
impl Display for DependencyGraph {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "graph LR")?;

        for index in self.graph.node_indices() {
            let node = &self.graph[index];
            writeln!(
                f,
                "    {}[\"{}\\n{}\"]",
                index.index(),
                escape(&node.name),
                type_label(node.task_type)
            )?;
        }

        for edge in self.graph.raw_edges() {
            writeln!(f, "    {} --> {}", edge.source().index(), edge.target().index())?;
        }

        Ok(())
    }
}

/// Per-task timings of the current frame, collected by
/// [`ReadyTask::run_profiled`](crate::ReadyTask::run_profiled).
#[derive(Debug, Default, Clone)]
pub struct Diagnostics {
    pub execution_times: HashMap<TaskId, TaskExecution>,
}

impl Diagnostics {
    pub(crate) fn capture(registry: &Registry) -> Self {
        let execution_times = registry
            .rows
            .iter()
            .enumerate()
            .filter_map(|(index, row)| Some((registry.id(index), (*row.slot.execution.lock())?)))
            .collect();

        Self { execution_times }
    }

    /// Sum of all task durations.
    pub fn busy_time(&self) -> Duration {
        self.execution_times.values().map(|t| t.duration).sum()
    }

    /// From the first task start to the last task end.
    pub fn wall_time(&self) -> Option<Duration> {
        let start = self.execution_times.values().map(|t| t.start).min()?;
        let end = self.execution_times.values().map(TaskExecution::end).max()?;
        Some(end.duration_since(start))
    }

    /// Renders the graph as a Mermaid diagram, coloured by execution time.
    ///
    /// * **Green**: fast
    /// * **Yellow**: moderate
    /// * **Red**: slow
    /// * **Blue**: did not run (placeholder, or not dispatched yet)
    pub fn render_mermaid(&self, graph: &DependencyGraph) -> String {
        let mut f = String::new();
        let _ = writeln!(f, "graph LR");

        let (min, max) = self.bounds();

        for index in graph.graph.node_indices() {
            let node = &graph.graph[index];

            let (label, colour) = match self.execution_times.get(&node.id) {
                Some(exec) => {
                    let t = (exec.duration.as_secs_f64() - min) / (max - min);
                    let (r, g, b) = heat(t);
                    (format!("{:.2?}", exec.duration), format!("#{r:02X}{g:02X}{b:02X}"))
                }
                None => ("Not run".to_string(), "#ADD8E6".to_string()),
            };

            let _ = writeln!(f, "    {}[\"{}\\n{}\"]", index.index(), escape(&node.name), label);
            let _ = writeln!(f, "    style {} fill:{}", index.index(), colour);
        }

        for edge in graph.graph.raw_edges() {
            let _ = writeln!(f, "    {} --> {}", edge.source().index(), edge.target().index());
        }

        f
    }

    fn bounds(&self) -> (f64, f64) {
        let secs = self.execution_times.values().map(|t| t.duration.as_secs_f64());
        let min = secs.clone().fold(f64::MAX, f64::min);
        let max = secs.fold(f64::MIN, f64::max);

        if min > max {
            return (0.0, 1.0);
        }

        if (max - min).abs() < f64::EPSILON {
            return (min, min + 1.0);
        }

        (min, max)
    }
}

/// 0.0 is green, 0.5 yellow, 1.0 red.
fn heat(t: f64) -> (u8, u8, u8) {
    let t = t.clamp(0.0, 1.0);
    if t < 0.5 {
        ((255.0 * t * 2.0) as u8, 255, 0)
    } else {
        (255, (255.0 * (1.0 - (t - 0.5) * 2.0)) as u8, 0)
    }
}

// WATERFALL

struct XmlSafe<'a>(&'a str);

impl Display for XmlSafe<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for c in self.0.chars() {
            match c {
                '<' => f.write_str("&lt;")?,
                '>' => f.write_str("&gt;")?,
                '&' => f.write_str("&amp;")?,
                '"' => f.write_str("&quot;")?,
                '\'' => f.write_str("&apos;")?,
                _ => f.write_char(c)?,
            }
        }
        Ok(())
    }
}

const ROW_HEIGHT: u32 = 24;
const LABEL_WIDTH: u32 = 240;
const CHART_WIDTH: u32 = 800;
const PADDING: u32 = 10;
const HEADER_HEIGHT: u32 = 30;

fn format_micros(micros: f64) -> String {
    if micros < 1000.0 {
        format!("{micros:.0}µs")
    } else {
        format!("{:.2}ms", micros / 1000.0)
    }
}

impl Diagnostics {
    /// Renders a timeline of the frame as an SVG document, one row per task
    /// that ran, in start order.
    pub fn render_waterfall(&self, graph: &DependencyGraph) -> String {
        let mut rows: Vec<(&str, &TaskExecution)> = self
            .execution_times
            .iter()
            .map(|(id, exec)| {
                let name = graph.node(*id).map(|n| n.name.as_str()).unwrap_or("?");
                (name, exec)
            })
            .collect();

        let Some(origin) = rows.iter().map(|(_, t)| t.start).min() else {
            return r#"<svg width="200" height="50" xmlns="http://www.w3.org/2000/svg"><text x="10" y="30" font-family="sans-serif">No tasks ran</text></svg>"#.to_string();
        };

        rows.sort_by_key(|(_, t)| t.start);

        let end = rows.iter().map(|(_, t)| t.end()).max().unwrap_or(origin);
        let total = end.duration_since(origin).as_micros().max(1) as f64;

        let width = LABEL_WIDTH + CHART_WIDTH + PADDING * 3 + 80;
        let height = HEADER_HEIGHT + rows.len() as u32 * ROW_HEIGHT + PADDING;

        let mut svg = String::with_capacity(rows.len() * 400);
        let _ = write!(
            svg,
            r#"<svg width="{width}" height="{height}" xmlns="http://www.w3.org/2000/svg"><style>text {{ font-family: sans-serif; font-size: 12px; }} .bar {{ fill: #3b82f6; }} .grid {{ stroke: #e5e7eb; }} .axis {{ fill: #9ca3af; font-size: 10px; }}</style><rect width="100%" height="100%" fill="white" />"#
        );

        for step in 0..=5 {
            let pct = step as f64 / 5.0;
            let x = (LABEL_WIDTH + PADDING) as f64 + CHART_WIDTH as f64 * pct;
            let _ = write!(
                svg,
                r#"<line x1="{x:.1}" y1="{HEADER_HEIGHT}" x2="{x:.1}" y2="100%" class="grid" /><text x="{x:.1}" y="{}" text-anchor="middle" class="axis">{}</text>"#,
                HEADER_HEIGHT - 5,
                format_micros(total * pct)
            );
        }

        for (i, (name, exec)) in rows.iter().enumerate() {
            let y = HEADER_HEIGHT + i as u32 * ROW_HEIGHT;
            let offset = exec.start.duration_since(origin).as_micros() as f64;
            let micros = exec.duration.as_micros() as f64;

            let x = (LABEL_WIDTH + PADDING) as f64 + offset / total * CHART_WIDTH as f64;
            let w = (micros / total * CHART_WIDTH as f64).max(1.0);

            let _ = write!(
                svg,
                r#"<text x="{PADDING}" y="{}" dominant-baseline="middle">{}</text><rect x="{x:.1}" y="{}" width="{w:.1}" height="{}" class="bar"><title>{}: {:.2?}</title></rect><text x="{:.1}" y="{}" dominant-baseline="middle">{}</text>"#,
                y + ROW_HEIGHT / 2,
                XmlSafe(name),
                y + 4,
                ROW_HEIGHT - 8,
                XmlSafe(name),
                exec.duration,
                x + w + 5.0,
                y + ROW_HEIGHT / 2,
                format_micros(micros)
            );
        }

        svg.push_str("</svg>");
        svg
    }
}
