/// Type-erased error used at seams where a concrete enum would force every
/// collaborator into one taxonomy.
pub type AnyError = anyhow::Error;

pub type AnyResult<T, E = AnyError> = std::result::Result<T, E>;
