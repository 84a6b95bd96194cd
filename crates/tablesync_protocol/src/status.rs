//! Classification of response status codes.

/// How a response status should be treated by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    /// 2xx.
    Ok,
    /// 401; the access token must be renewed.
    AuthRequired,
    /// 403; permanent denial.
    AccessDenied,
    /// Any other status.
    Failure,
}

impl ResponseClass {
    /// Classifies an HTTP status code.
    pub fn from_status(status: u16) -> Self {
        match status {
            200..=299 => ResponseClass::Ok,
            401 => ResponseClass::AuthRequired,
            403 => ResponseClass::AccessDenied,
            _ => ResponseClass::Failure,
        }
    }

    /// Returns true for a successful status.
    pub fn is_ok(&self) -> bool {
        matches!(self, ResponseClass::Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_statuses() {
        assert_eq!(ResponseClass::from_status(200), ResponseClass::Ok);
        assert_eq!(ResponseClass::from_status(201), ResponseClass::Ok);
        assert_eq!(ResponseClass::from_status(401), ResponseClass::AuthRequired);
        assert_eq!(ResponseClass::from_status(403), ResponseClass::AccessDenied);
        assert_eq!(ResponseClass::from_status(409), ResponseClass::Failure);
        assert_eq!(ResponseClass::from_status(503), ResponseClass::Failure);
        assert!(!ResponseClass::from_status(304).is_ok());
    }
}
