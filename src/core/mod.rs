pub mod outbound;
pub mod tlv;
