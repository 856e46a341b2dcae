//! Deterministic greedy distance-2 vertex colouring.
//!
//! The adaptation schedulers need colour classes in which no two vertices
//! share an incident element; a distance-2 colouring of the vertex adjacency
//! graph guarantees that for simplicial meshes. Vertices are visited in
//! ascending global-number order and given the smallest positive colour not
//! used within distance 2, so any two ranks that both see a vertex and its
//! full neighbourhood assign it the same colour without communication.
//!
//! Vertices with empty adjacency stay at colour `-1` and are excluded from
//! every colour bag.

/// Colour the graph; `gnn[v]` supplies the traversal order key.
///
/// Returns one colour per vertex: a contiguous positive integer for vertices
/// with neighbours, `-1` otherwise.
pub fn colour_distance2(nnlist: &[Vec<usize>], gnn: &[usize]) -> Vec<i32> {
    let n = nnlist.len();
    debug_assert_eq!(gnn.len(), n);

    let mut order: Vec<usize> = (0..n).filter(|&v| !nnlist[v].is_empty()).collect();
    order.sort_unstable_by_key(|&v| gnn[v]);

    let mut colour = vec![-1i32; n];
    let mut forbidden: Vec<i32> = Vec::new();
    for &v in &order {
        forbidden.clear();
        for &w in &nnlist[v] {
            if colour[w] > 0 {
                forbidden.push(colour[w]);
            }
            for &x in &nnlist[w] {
                if x != v && colour[x] > 0 {
                    forbidden.push(colour[x]);
                }
            }
        }
        forbidden.sort_unstable();
        forbidden.dedup();

        let mut c = 1i32;
        for &f in &forbidden {
            if f == c {
                c += 1;
            } else if f > c {
                break;
            }
        }
        colour[v] = c;
    }
    colour
}

/// Highest colour in use, or -1 if nothing is coloured.
pub fn max_colour(colour: &[i32]) -> i32 {
    colour.iter().copied().max().unwrap_or(-1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn assert_distance2_valid(nnlist: &[Vec<usize>], colour: &[i32]) {
        for v in 0..nnlist.len() {
            if colour[v] < 0 {
                continue;
            }
            for &w in &nnlist[v] {
                assert_ne!(colour[v], colour[w], "adjacent {v} and {w} share a colour");
                for &x in &nnlist[w] {
                    if x != v {
                        assert_ne!(
                            colour[v], colour[x],
                            "distance-2 pair {v} and {x} share a colour"
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn path_graph_uses_three_colours() {
        let nnlist = vec![vec![1], vec![0, 2], vec![1, 3], vec![2]];
        let gnn: Vec<usize> = (0..4).collect();
        let colour = colour_distance2(&nnlist, &gnn);
        assert_distance2_valid(&nnlist, &colour);
        assert_eq!(max_colour(&colour), 3);
    }

    #[test]
    fn isolated_vertices_stay_uncoloured() {
        let nnlist = vec![vec![1], vec![0], vec![]];
        let colour = colour_distance2(&nnlist, &[0, 1, 2]);
        assert_eq!(colour[2], -1);
        assert!(colour[0] > 0 && colour[1] > 0);
    }

    #[test]
    fn order_key_controls_assignment() {
        // Reversing the order key permutes assignments but keeps validity.
        let nnlist = vec![vec![1, 2], vec![0, 2], vec![0, 1]];
        let forward = colour_distance2(&nnlist, &[0, 1, 2]);
        let backward = colour_distance2(&nnlist, &[2, 1, 0]);
        assert_distance2_valid(&nnlist, &forward);
        assert_distance2_valid(&nnlist, &backward);
        assert_eq!(forward[0], backward[2]);
    }

    proptest! {
        #[test]
        fn random_graphs_yield_valid_distance2_colourings(
            edges in proptest::collection::vec((0usize..20, 0usize..20), 0..60)
        ) {
            let mut nnlist = vec![Vec::new(); 20];
            for (a, b) in edges {
                if a != b && !nnlist[a].contains(&b) {
                    nnlist[a].push(b);
                    nnlist[b].push(a);
                }
            }
            let gnn: Vec<usize> = (0..20).collect();
            let colour = colour_distance2(&nnlist, &gnn);
            assert_distance2_valid(&nnlist, &colour);
        }
    }
}
