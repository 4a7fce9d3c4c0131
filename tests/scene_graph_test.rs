use cgmath::{Matrix4, SquareMatrix, Vector3, Vector4};
use flow_vfx::data_structures::scene_graph::SceneGraph;

fn assert_matrix_eq(a: Matrix4<f32>, b: Matrix4<f32>) {
    let (a, b): ([[f32; 4]; 4], [[f32; 4]; 4]) = (a.into(), b.into());
    for (col_a, col_b) in a.iter().zip(b.iter()) {
        for (x, y) in col_a.iter().zip(col_b.iter()) {
            assert!((x - y).abs() < 1e-5, "{:?} != {:?}", a, b);
        }
    }
}

#[test]
fn world_matrix_composes_the_whole_chain() {
    let mut graph = SceneGraph::new();
    let root = graph.create_node();
    let arm = graph.create_node();
    let hand = graph.create_node();
    graph.set_parent(arm, Some(root));
    graph.set_parent(hand, Some(arm));

    graph.set_position(root, Vector3::new(1.0, 0.0, 0.0));
    graph.set_scale(root, Vector3::new(2.0, 2.0, 2.0));
    graph.set_rotation(arm, Vector3::new(0.0, 0.0, std::f32::consts::FRAC_PI_2));
    graph.set_position(hand, Vector3::new(1.0, 0.0, 0.0));

    for node in [arm, hand] {
        let parent = graph.parent(node).unwrap();
        assert_matrix_eq(
            graph.world_matrix(node).unwrap(),
            graph.world_matrix(parent).unwrap() * graph.local_matrix(node).unwrap(),
        );
    }

    // (1,0,0) in the hand: rotated onto +y, scaled by 2, moved by +1 on x.
    let origin = graph.world_matrix(hand).unwrap() * Vector4::new(0.0, 0.0, 0.0, 1.0);
    assert!((origin.x - 1.0).abs() < 1e-5);
    assert!((origin.y - 2.0).abs() < 1e-5);
}

#[test]
fn reparenting_keeps_local_and_moves_world() {
    let mut graph = SceneGraph::new();
    let left = graph.create_node();
    let right = graph.create_node();
    let child = graph.create_node();
    graph.set_position(left, Vector3::new(-3.0, 0.0, 0.0));
    graph.set_position(right, Vector3::new(3.0, 0.0, 0.0));
    graph.set_position(child, Vector3::new(0.0, 1.0, 0.0));

    graph.set_parent(child, Some(left));
    let local = graph.local_matrix(child).unwrap();
    assert_eq!(graph.world_matrix(child).unwrap().w.x, -3.0);

    graph.set_parent(child, Some(right));
    assert_eq!(graph.local_matrix(child).unwrap(), local);
    assert_eq!(graph.world_matrix(child).unwrap().w.x, 3.0);
    assert!(graph.children(left).is_empty());
    assert_eq!(graph.children(right), &[child]);

    graph.set_parent(child, None);
    assert_matrix_eq(graph.world_matrix(child).unwrap(), local);
    assert_eq!(graph.roots().count(), 3);
}

#[test]
fn parent_changes_reach_grandchildren() {
    let mut graph = SceneGraph::new();
    let root = graph.create_node();
    let middle = graph.create_node();
    let leaf = graph.create_node();
    graph.set_parent(middle, Some(root));
    graph.set_parent(leaf, Some(middle));
    assert_matrix_eq(graph.world_matrix(leaf).unwrap(), Matrix4::identity());

    graph.set_position(root, Vector3::new(0.0, 0.0, -7.0));
    assert_eq!(graph.world_matrix(leaf).unwrap().w.z, -7.0);

    let normal = graph.normal_matrix(leaf).unwrap();
    assert_eq!(normal, cgmath::Matrix3::identity());
}
