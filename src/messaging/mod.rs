pub mod dto;
pub mod inbound;
pub mod message_type;
pub mod messenger;
pub mod packet_id;
