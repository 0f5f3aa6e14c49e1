use crate::error::Error;
use crate::shape::Shape;

/// Broadcast shape of two operands: shapes are right-aligned, and each pair of
/// dimensions must be equal or contain a 1.
pub fn broadcast_shapes(a: &Shape, b: &Shape) -> Result<Shape, Error> {
    let rank = a.rank().max(b.rank());
    let (a, b) = (a.expanded(rank), b.expanded(rank));
    let mut result = Vec::with_capacity(rank);
    for (i, (&a_dim, &b_dim)) in a.dims().iter().zip(b.dims()).enumerate() {
        if a_dim == b_dim || a_dim == 1 || b_dim == 1 {
            result.push(a_dim.max(b_dim));
        } else {
            return Err(Error::shape_mismatch(
                "broadcast",
                format!("dimension {i} cannot broadcast {a_dim} against {b_dim} ({a} vs {b})"),
            ));
        }
    }
    Shape::new(&result)
}

/// True when `a` and `b` are the same shape once left-padded to a common rank.
pub fn same_expanded(a: &Shape, b: &Shape) -> bool {
    let rank = a.rank().max(b.rank());
    a.expanded(rank) == b.expanded(rank)
}
