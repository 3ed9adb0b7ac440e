use serde::{Deserialize, Serialize};

/// A point in normalized [0, 1] image coordinates.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

impl From<(f64, f64)> for Point {
    fn from((x, y): (f64, f64)) -> Self {
        Self { x, y }
    }
}

/// Closed polygon given as an ordered vertex list. The last vertex connects
/// back to the first one.
///
/// Serialized as a list of `[x, y]` pairs, which is how operators draw ROIs.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(from = "Vec<[f64; 2]>", into = "Vec<[f64; 2]>")]
pub struct Polygon {
    vertices: Vec<Point>,
}

impl Polygon {
    pub fn new(vertices: Vec<Point>) -> Self {
        Self { vertices }
    }

    pub fn vertices(&self) -> &[Point] {
        &self.vertices
    }

    /// Less than three vertices encloses no area.
    pub fn is_degenerate(&self) -> bool {
        self.vertices.len() < 3
    }

    pub fn contains(&self, point: Point) -> bool {
        contains(self, point)
    }
}

impl From<Vec<[f64; 2]>> for Polygon {
    fn from(raw: Vec<[f64; 2]>) -> Self {
        Self::new(raw.into_iter().map(|[x, y]| Point::new(x, y)).collect())
    }
}

impl From<Polygon> for Vec<[f64; 2]> {
    fn from(polygon: Polygon) -> Self {
        polygon.vertices.into_iter().map(|p| [p.x, p.y]).collect()
    }
}

/// Even-odd ray casting: count how many polygon edges a horizontal ray from
/// `point` towards +x crosses. Degenerate polygons contain nothing.
pub fn contains(polygon: &Polygon, point: Point) -> bool {
    if polygon.is_degenerate() {
        tracing::trace!(
            vertices = polygon.vertices.len(),
            "degenerate polygon, treating as empty"
        );
        return false;
    }

    let vertices = &polygon.vertices;
    let mut inside = false;
    let mut j = vertices.len() - 1;

    for i in 0..vertices.len() {
        let (a, b) = (vertices[i], vertices[j]);
        if (a.y > point.y) != (b.y > point.y) {
            let x_cross = (b.x - a.x) * (point.y - a.y) / (b.y - a.y) + a.x;
            if point.x < x_cross {
                inside = !inside;
            }
        }
        j = i;
    }

    inside
}

/// Center of an `[x, y, w, h]` bounding box.
pub fn bbox_center(rect: [f64; 4]) -> Point {
    let [x, y, w, h] = rect;
    Point::new(x + 0.5 * w, y + 0.5 * h)
}
