//! Smoothing scenarios: anisotropic strip relaxation and degenerate-metric
//! handling.

use mesh_adapt::prelude::*;

/// Three-row strip over [0,1] x [0,0.1], interior row perturbed in x.
/// The metric stretches x so a 0.1 spacing measures unit length.
fn perturbed_strip() -> Mesh {
    let cols = 11usize;
    let rows = [0.0, 0.05, 0.1];
    let mut coords = Vec::new();
    for (j, &y) in rows.iter().enumerate() {
        for i in 0..cols {
            let mut x = i as f64 / 10.0;
            // Shift the interior row off the relaxed positions.
            if j == 1 && i > 0 && i < 10 {
                x -= 0.035;
            }
            coords.push(x);
            coords.push(y);
        }
    }
    let at = |i: usize, j: usize| j * cols + i;
    let mut tris = Vec::new();
    for j in 0..2 {
        for i in 0..10 {
            let (a, b, c, d) = (at(i, j), at(i + 1, j), at(i + 1, j + 1), at(i, j + 1));
            tris.extend_from_slice(&[a, b, c, a, c, d]);
        }
    }
    let mut mesh = Mesh::new_2d(&coords, &tris);
    for v in 0..mesh.num_nodes() {
        mesh.set_metric(v, &[100.0, 0.0, 1.0]);
    }
    mesh.build_adjacency();
    mesh
}

#[test]
fn strip_is_valid_input() {
    let mesh = perturbed_strip();
    mesh.validate_invariants().unwrap();
}

#[test]
fn optimisation_linf_raises_min_quality_without_inverting() {
    let mut mesh = perturbed_strip();
    let comm = NoComm;
    let property = ElementProperty::new(Dim::Two);

    let quality_of = |mesh: &Mesh| -> f64 {
        (0..mesh.num_elements())
            .filter_map(|e| mesh.element(e))
            .map(|verts| {
                let xs: Vec<[f64; 3]> = verts.iter().map(|&v| mesh.coord(v)).collect();
                let ms: Vec<&[f64]> = verts.iter().map(|&v| mesh.metric_of(v)).collect();
                property.lipnikov(&xs, &ms)
            })
            .fold(f64::INFINITY, f64::min)
    };

    let before = quality_of(&mesh);
    assert!(before > 0.0, "input must not be inverted");

    let mut smooth = Smooth::new(&mut mesh, &comm);
    smooth.smooth("optimisation Linf", 5, None).unwrap();

    let after = quality_of(&mesh);
    assert!(
        after > before,
        "minimum quality must strictly improve: {before} -> {after}"
    );
    // No element may be inverted.
    mesh.validate_invariants().unwrap();
}

#[test]
fn smart_laplacian_never_decreases_min_quality() {
    let mut mesh = perturbed_strip();
    let comm = NoComm;
    let property = ElementProperty::new(Dim::Two);

    let quality_of = |mesh: &Mesh| -> f64 {
        (0..mesh.num_elements())
            .filter_map(|e| mesh.element(e))
            .map(|verts| {
                let xs: Vec<[f64; 3]> = verts.iter().map(|&v| mesh.coord(v)).collect();
                let ms: Vec<&[f64]> = verts.iter().map(|&v| mesh.metric_of(v)).collect();
                property.lipnikov(&xs, &ms)
            })
            .fold(f64::INFINITY, f64::min)
    };

    let mut previous = quality_of(&mesh);
    for _ in 0..3 {
        let mut smooth = Smooth::new(&mut mesh, &comm);
        smooth.smooth("smart Laplacian", 1, None).unwrap();
        let current = quality_of(&mesh);
        assert!(
            current >= previous - 1e-12,
            "min quality decreased: {previous} -> {current}"
        );
        previous = current;
    }
    mesh.validate_invariants().unwrap();
}

#[test]
fn boundary_vertices_never_move() {
    let mut mesh = perturbed_strip();
    let boundary = mesh.boundary_nodes();
    let before: Vec<(usize, [f64; 3])> =
        boundary.iter().map(|&v| (v, mesh.coord(v))).collect();

    let comm = NoComm;
    let mut smooth = Smooth::new(&mut mesh, &comm);
    smooth.smooth("optimisation Linf", 3, None).unwrap();

    for (v, x) in before {
        assert_eq!(mesh.coord(v), x, "boundary vertex {v} moved");
    }
}
