//! Localized user-facing strings.
//!
//! Error messages are written in English and double as lookup keys. Strings
//! missing from a catalog fall back to the English original.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lang {
    #[default]
    En,
    Ar,
}

impl Lang {
    /// Parse a `lang` header value, defaulting to English.
    pub fn from_header(value: Option<&str>) -> Self {
        value.and_then(|v| v.parse().ok()).unwrap_or_default()
    }
}

impl FromStr for Lang {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "en" => Ok(Self::En),
            "ar" => Ok(Self::Ar),
            _ => Err(()),
        }
    }
}

const AR: &[(&str, &str)] = &[
    ("Chat not found", "الدردشة غير موجودة"),
    ("Please provide either chat id or receiver id", "يرجى تقديم معرف الدردشة او معرف المستقبل"),
    ("You are not a participant in this chat", "انت لست مشارك في هذه الدردشة"),
    ("User not found", "المستخدم غير موجود"),
    ("You Can't Block Yourself", "لا يمكنك حظر نفسك"),
    ("Media file is required", "الملف الوسائط مطلوب"),
    ("Invalid Input Data", "بيانات غير صحيحة"),
    ("Session expired, please login again...", "انتهت الجلسة، يرجى تسجيل الدخول مرة أخرى..."),
    ("account is deactivated", "تم إلغاء تنشيط هذا الحساب"),
    ("Invalid token, please login again...", "رمز غير صالح، يرجى تسجيل الدخول مرة أخرى..."),
    (
        "Your account is blocked, please contact the support team",
        "حسابك محظور, يرجى الاتصال بفريق الدعم",
    ),
    ("Something went wrong", "حدث خطأ ما"),
    ("New message from", "رسالة جديدة من"),
    ("User Has been Blocked Successfully", "تم حظر المستخدم بنجاح"),
    ("User Has been Unblocked Successfully", "تم إلغاء حظر المستخدم بنجاح"),
    ("Chat cleared successfully", "تم مسح الدردشة بنجاح"),
    ("You can't send messages in a blocked chat", "لا يمكنك إرسال رسائل في دردشة محظورة"),
];

/// Translate `text` into `lang`.
pub fn translate(text: &str, lang: Lang) -> String {
    match lang {
        Lang::En => text.to_string(),
        Lang::Ar => AR
            .iter()
            .find(|(en, _)| *en == text)
            .map(|(_, ar)| ar.to_string())
            .unwrap_or_else(|| text.to_string()),
    }
}
