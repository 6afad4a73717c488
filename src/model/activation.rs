/// The activation functions available to dense layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    /// `x * sigmoid(x)`.
    Swish,
    Tanh,
}

fn sigmoid(x: f32) -> f32 {
    1. / (1. + (-x).exp())
}

impl Activation {
    pub fn f(&self, x: f32) -> f32 {
        match self {
            Activation::Swish => x * sigmoid(x),
            Activation::Tanh => x.tanh(),
        }
    }

    pub fn df(&self, x: f32) -> f32 {
        match self {
            Activation::Swish => {
                let s = sigmoid(x);
                s + x * s * (1. - s)
            }
            Activation::Tanh => 1. - x.tanh().powi(2),
        }
    }
}
