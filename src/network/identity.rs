/// Classifies identity strings exchanged on the identity line.
///
/// The id grammar belongs to the object protocol; this layer only needs a
/// pass/fail answer, so it is injectable.
pub trait IdentityValidator: Send + Sync {
    fn is_full_object_id(&self, id: &str) -> bool;
    fn is_full_service_id(&self, id: &str) -> bool;
}

/// Object ids look like `11111-22222-33333`, service ids like `srvId/usrId/instId`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultIdentityValidator;

fn three_parts(id: &str, sep: char, part_ok: impl Fn(&str) -> bool) -> bool {
    let parts: Vec<&str> = id.split(sep).collect();
    parts.len() == 3 && parts.iter().all(|p| !p.is_empty() && part_ok(p))
}

impl IdentityValidator for DefaultIdentityValidator {
    fn is_full_object_id(&self, id: &str) -> bool {
        three_parts(id, '-', |p| p.chars().all(|c| c.is_ascii_alphanumeric()))
    }

    fn is_full_service_id(&self, id: &str) -> bool {
        three_parts(id, '/', |p| !p.chars().any(char::is_whitespace))
    }
}
