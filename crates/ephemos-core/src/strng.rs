use std::ops::Deref;

use arcstr::ArcStr;
use prometheus_client::encoding::{EncodeLabelValue, LabelValueEncoder};

/// Strng is a cheaply-clonable, immutable string type.
/// Identity components, session ids, and metric labels are copied around
/// constantly; an `Arc`-backed string keeps those clones O(1).
pub type Strng = ArcStr;

pub use arcstr::format;
pub use arcstr::literal;

pub fn new<A: AsRef<str>>(s: A) -> Strng {
	ArcStr::from(s.as_ref())
}

/// RichStrng wraps Strng to let us implement foreign traits (prometheus encoding).
#[derive(Clone, Hash, Default, Debug, PartialEq, Eq)]
pub struct RichStrng(Strng);

impl RichStrng {
	pub fn inner(&self) -> &Strng {
		&self.0
	}
}

impl<T: Into<Strng>> From<T> for RichStrng {
	fn from(value: T) -> Self {
		RichStrng(value.into())
	}
}

impl Deref for RichStrng {
	type Target = str;

	fn deref(&self) -> &Self::Target {
		self.0.deref()
	}
}

impl std::fmt::Display for RichStrng {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl EncodeLabelValue for RichStrng {
	fn encode(&self, writer: &mut LabelValueEncoder) -> Result<(), std::fmt::Error> {
		use std::fmt::Write;
		writer.write_str(self.0.as_str())
	}
}
