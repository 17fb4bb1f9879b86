//! Supported currencies and amount formatting
//!
//! Amounts are always carried in the currency's minor unit (cents, kobo,
//! yen). The table below decides which codes offers may use and how receipts
//! render them.

/// A supported settlement currency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Currency {
    pub code: &'static str,
    pub symbol: &'static str,
    /// Digits after the decimal point in the major unit.
    pub minor_digits: u32,
}

const CURRENCIES: &[Currency] = &[
    Currency { code: "USD", symbol: "$", minor_digits: 2 },
    Currency { code: "EUR", symbol: "€", minor_digits: 2 },
    Currency { code: "GBP", symbol: "£", minor_digits: 2 },
    Currency { code: "NGN", symbol: "₦", minor_digits: 2 },
    Currency { code: "KES", symbol: "KSh ", minor_digits: 2 },
    Currency { code: "GHS", symbol: "GH₵", minor_digits: 2 },
    Currency { code: "ZAR", symbol: "R", minor_digits: 2 },
    Currency { code: "INR", symbol: "₹", minor_digits: 2 },
    Currency { code: "JPY", symbol: "¥", minor_digits: 0 },
    Currency { code: "CAD", symbol: "CA$", minor_digits: 2 },
    Currency { code: "AUD", symbol: "A$", minor_digits: 2 },
];

/// Case-insensitive lookup by ISO 4217 code.
pub fn lookup(code: &str) -> Option<&'static Currency> {
    CURRENCIES.iter().find(|c| c.code.eq_ignore_ascii_case(code.trim()))
}

/// Render `amount` minor units, e.g. `$1,234.50` or `¥5,000`.
///
/// Unknown codes fall back to `<amount> <CODE>`.
pub fn format_minor(amount: u64, code: &str) -> String {
    let Some(currency) = lookup(code) else {
        return format!("{amount} {}", code.trim().to_ascii_uppercase());
    };

    let scale = 10u64.pow(currency.minor_digits);
    let major = group_thousands(amount / scale);
    if currency.minor_digits == 0 {
        format!("{}{major}", currency.symbol)
    } else {
        let minor = amount % scale;
        let width = currency.minor_digits as usize;
        format!("{}{major}.{minor:0width$}", currency.symbol)
    }
}

fn group_thousands(value: u64) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}
