//! Surface classification over 3D meshes: patch formation on a cube,
//! corner and collapsibility predicates, and idempotent reclassification.

use mesh_adapt::prelude::*;

/// Unit cube cut into six tetrahedra sharing the main diagonal 0-6.
fn cube_six_tets() -> Mesh {
    let coords = [
        0.0, 0.0, 0.0, // 0
        1.0, 0.0, 0.0, // 1
        1.0, 1.0, 0.0, // 2
        0.0, 1.0, 0.0, // 3
        0.0, 0.0, 1.0, // 4
        1.0, 0.0, 1.0, // 5
        1.0, 1.0, 1.0, // 6
        0.0, 1.0, 1.0, // 7
    ];
    let tets = [
        0, 1, 2, 6, //
        0, 2, 3, 6, //
        0, 3, 7, 6, //
        0, 7, 4, 6, //
        0, 4, 5, 6, //
        0, 5, 1, 6, //
    ];
    Mesh::new_3d(&coords, &tets)
}

#[test]
fn cube_classifies_into_six_coplanar_patches() {
    let mesh = cube_six_tets();
    mesh.validate_invariants().unwrap();

    let surface = Surface::new(&mesh);
    // Each cube face is two triangles.
    assert_eq!(surface.live_facets(), 12);
    assert_eq!(surface.num_patches(), 6);
}

#[test]
fn cube_corners_touch_three_patches() {
    let mesh = cube_six_tets();
    let surface = Surface::new(&mesh);

    for v in 0..8 {
        assert!(surface.contains_node(v));
        assert!(surface.is_corner_vertex(v), "cube corner {v}");
        // Corners are pinned: no collapse target is admissible.
        for w in 0..8 {
            if w != v {
                assert!(!surface.is_collapsible(v, w));
            }
        }
    }
}

#[test]
fn cube_normals_are_axis_aligned_and_outward() {
    let mesh = cube_six_tets();
    let surface = Surface::new(&mesh);

    for i in 0..surface.num_facets() {
        let facet = surface.facet(i).unwrap();
        let n = surface.normal(i);
        // Exactly one non-zero component, magnitude one.
        let nonzero: Vec<f64> = n.iter().copied().filter(|c| c.abs() > 1e-12).collect();
        assert_eq!(nonzero.len(), 1, "normal {n:?} of facet {facet:?}");
        assert!((nonzero[0].abs() - 1.0).abs() < 1e-12);

        // Outward: the facet centroid moved along the normal leaves [0,1]^3.
        let mut mid = [0.0f64; 3];
        for &v in facet {
            let x = mesh.coord(v);
            for k in 0..3 {
                mid[k] += x[k] / 3.0;
            }
        }
        let probe: Vec<f64> = (0..3).map(|k| mid[k] + 0.25 * n[k]).collect();
        assert!(
            probe.iter().any(|&c| !(0.0..=1.0).contains(&c)),
            "normal {n:?} of facet {facet:?} points inward"
        );
    }
}

#[test]
fn reclassification_is_stable() {
    let mesh = cube_six_tets();
    let mut surface = Surface::new(&mesh);

    let facets: Vec<Option<Vec<usize>>> = (0..surface.num_facets())
        .map(|i| surface.facet(i).map(|f| f.to_vec()))
        .collect();
    let ids: Vec<i32> = (0..surface.num_facets()).map(|i| surface.coplanar_id(i)).collect();

    surface.find_surface(&mesh);

    let facets2: Vec<Option<Vec<usize>>> = (0..surface.num_facets())
        .map(|i| surface.facet(i).map(|f| f.to_vec()))
        .collect();
    let ids2: Vec<i32> = (0..surface.num_facets()).map(|i| surface.coplanar_id(i)).collect();

    assert_eq!(facets, facets2);
    assert_eq!(ids, ids2);
}

#[test]
fn face_interior_vertex_is_not_a_corner() {
    // Regular tetrahedron with its bottom face subdivided at the centroid.
    let s3 = 3f64.sqrt();
    let coords = [
        0.0,
        0.0,
        0.0, // 0
        1.0,
        0.0,
        0.0, // 1
        0.5,
        s3 / 2.0,
        0.0, // 2
        0.5,
        s3 / 6.0,
        (2f64 / 3.0).sqrt(), // 3 apex
        0.5,
        s3 / 6.0,
        0.0, // 4 face centroid
    ];
    let tets = [0, 1, 4, 3, 1, 2, 4, 3, 2, 0, 4, 3];
    let mesh = Mesh::new_3d(&coords, &tets);
    mesh.validate_invariants().unwrap();

    let surface = Surface::new(&mesh);
    // Three subdivided bottom facets in one patch, three whole side faces.
    assert_eq!(surface.live_facets(), 6);
    assert_eq!(surface.num_patches(), 4);

    assert!(!surface.is_corner_vertex(4));
    for v in 0..4 {
        assert!(surface.is_corner_vertex(v));
    }
    // The centroid may slide within its patch only.
    assert!(surface.is_collapsible(4, 0));
    assert!(surface.is_collapsible(4, 1));
    assert!(surface.is_collapsible(4, 2));
    assert!(!surface.is_collapsible(4, 3));
}
