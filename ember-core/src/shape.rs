use crate::error::{EmberError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Shape {
    dims: Vec<usize>,
}

impl Shape {
    pub fn new(dims: Vec<usize>) -> Self {
        Self { dims }
    }

    pub fn from_dims(dims: &[usize]) -> Self {
        Self { dims: dims.to_vec() }
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn elem_count(&self) -> usize {
        self.dims.iter().product()
    }

    /// Size of one dimension, erroring when `dim` is out of range.
    pub fn dim(&self, dim: usize) -> Result<usize> {
        self.dims.get(dim).copied().ok_or_else(|| {
            EmberError::InvalidShape(format!(
                "dimension {} out of range for shape {}",
                dim, self
            ))
        })
    }

    /// Destructure a rank-4 shape.
    pub fn dims4(&self) -> Result<(usize, usize, usize, usize)> {
        match self.dims.as_slice() {
            &[a, b, c, d] => Ok((a, b, c, d)),
            _ => Err(EmberError::rank("tensor", 4, self)),
        }
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Shape::from_dims(dims)
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(dims: [usize; N]) -> Self {
        Shape::new(dims.to_vec())
    }
}

impl std::fmt::Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[")?;
        for (i, dim) in self.dims.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", dim)?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::Shape;

    #[test]
    fn element_count_and_display() {
        let s = Shape::from([2, 3, 4, 5]);
        assert_eq!(s.elem_count(), 120);
        assert_eq!(s.rank(), 4);
        assert_eq!(s.to_string(), "[2, 3, 4, 5]");
    }

    #[test]
    fn dims4_rejects_other_ranks() {
        assert!(Shape::from([1, 2, 3]).dims4().is_err());
        assert_eq!(Shape::from([1, 2, 3, 4]).dims4().unwrap(), (1, 2, 3, 4));
        assert!(Shape::from([1]).dim(1).is_err());
    }
}
