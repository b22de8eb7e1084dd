use faultline_agreement::Tag;
use prometheus_client::encoding::EncodeLabelSet;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct Message {
    pub tag: String,
}

impl Message {
    pub fn new(tag: Tag) -> Self {
        Self {
            tag: tag.to_string(),
        }
    }
}
