use crate::TypeKey;

/// An edge from a consumer to the producer it needs, labelled with the
/// type that flows along it.
pub type DepEdge = (usize, TypeKey);

/// Finds dependency cycles among nodes `0..deps.len()`.
///
/// `deps[n]` lists the producers node `n` depends on. Each cycle is
/// returned as a list of `(producer, type)` steps: every step's producer
/// provides its type to the step before it, and the first step's type is
/// needed by the last step's producer.
///
/// One cycle is reported per back edge found by the DFS.
pub fn find_cycles(deps: &[Vec<DepEdge>]) -> Vec<Vec<DepEdge>> {
    let mut visited = vec![false; deps.len()];
    let mut on_path = vec![false; deps.len()];
    // The DFS path, and for each entry the index of the next edge to follow.
    let mut path: Vec<DepEdge> = Vec::new();
    let mut next: Vec<usize> = Vec::new();
    let mut cycles = Vec::new();

    for root in 0..deps.len() {
        if visited[root] {
            continue;
        }
        // The label of a root is never part of a reported cycle.
        visited[root] = true;
        on_path[root] = true;
        path.push((root, TypeKey::of::<()>()));
        next.push(0);

        while let Some(&(node, _)) = path.last() {
            let Some(cursor) = next.last_mut() else {
                break;
            };
            let Some(&(dep, key)) = deps[node].get(*cursor) else {
                on_path[node] = false;
                path.pop();
                next.pop();
                continue;
            };
            *cursor += 1;

            if on_path[dep] {
                // Back edge: the cycle is everything above `dep` on the path.
                if let Some(start) = path.iter().position(|(n, _)| *n == dep) {
                    let mut cycle: Vec<DepEdge> = path[start + 1..].to_vec();
                    cycle.push((dep, key));
                    cycles.push(cycle);
                }
            } else if !visited[dep] {
                visited[dep] = true;
                on_path[dep] = true;
                path.push((dep, key));
                next.push(0);
            }
        }
    }

    cycles
}
