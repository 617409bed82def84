use altmount_core::CoreError;
use altmount_core::error::codes;

/// 以统一错误码构造“帧破损”错误。
pub(crate) fn frame(message: impl Into<String>) -> CoreError {
    CoreError::new(codes::DECODE_FAILED, message.into())
}

/// 以统一错误码构造“解密失败”错误。
pub(crate) fn decrypt(message: impl Into<String>) -> CoreError {
    CoreError::new(codes::DECRYPT_FAILED, message.into())
}
