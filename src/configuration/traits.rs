use miette::Result;


/// A configuration structure as deserialized from the TOML file, before
/// validation. Resolving validates the raw fields and produces the
/// structure the rest of the program works with.
pub trait ResolvableConfiguration {
    type Resolved;

    fn resolve(self) -> Result<Self::Resolved>;
}
