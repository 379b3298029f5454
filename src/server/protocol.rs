use serde::{Deserialize, Serialize};

/// Name of the multipart file field carrying the image
pub const IMAGE_FIELD: &str = "image";

/// JSON alternative to a multipart upload: the image encoded as base 64,
/// optionally wrapped in a `data:` URL
#[derive(Deserialize)]
pub struct B64Image {
    pub image: Option<String>,
}

impl std::fmt::Debug for B64Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let len = self.image.as_ref().map(String::len);
        write!(f, "B64Image {{ image: <{len:?} chars> }}")
    }
}

impl B64Image {
    /// The base 64 payload with any `data:<mime>;base64,` prefix removed
    pub fn payload(&self) -> Option<&str> {
        let image = self.image.as_deref()?;
        match image.strip_prefix("data:") {
            Some(url) => url.split_once(',').map(|(_, data)| data),
            None => Some(image),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

/// Body of `GET /`
#[derive(Debug, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub message: &'static str,
}

impl Health {
    pub const OK: Health = Health {
        status: "ok",
        message: "Potato disease detection API is running",
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b64(image: Option<&str>) -> B64Image {
        B64Image {
            image: image.map(String::from),
        }
    }

    #[test]
    fn test_payload() {
        assert_eq!(b64(None).payload(), None);
        assert_eq!(b64(Some("aGVsbG8=")).payload(), Some("aGVsbG8="));
        assert_eq!(
            b64(Some("data:image/png;base64,aGVsbG8=")).payload(),
            Some("aGVsbG8=")
        );
        assert_eq!(b64(Some("data:image/png;base64")).payload(), None);
    }
}
