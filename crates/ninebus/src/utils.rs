use crate::error;

pub type Result<T> = ::std::result::Result<T, error::Error>;

#[macro_export]
macro_rules! io_err {
    ($kind:ident, $msg:expr) => {
        ::std::io::Error::new(::std::io::ErrorKind::$kind, $msg)
    };
}

#[macro_export]
macro_rules! res {
    ($err:expr) => {
        Err(From::from($err))
    };
}

/// Split a dial string into protocol and address.
///
/// `tcp!host!port` becomes `("tcp", "host:port")` and `unix!path`
/// (optionally `unix!path!suffix`) becomes `("unix", path)`.
pub fn parse_proto(arg: &str) -> Option<(&str, String)> {
    let (proto, rest) = arg.split_once('!')?;

    match proto {
        "tcp" => {
            let (host, port) = rest.split_once('!')?;
            Some((proto, format!("{}:{}", host, port)))
        }
        "unix" => {
            let path = rest.split('!').next()?;
            Some((proto, path.to_owned()))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::parse_proto;

    #[test]
    fn parse_proto_forms() {
        assert_eq!(
            parse_proto("tcp!127.0.0.1!5640"),
            Some(("tcp", "127.0.0.1:5640".to_owned()))
        );
        assert_eq!(
            parse_proto("unix!/tmp/ninebus.sock!0"),
            Some(("unix", "/tmp/ninebus.sock".to_owned()))
        );
        assert_eq!(parse_proto("sctp!x!1"), None);
        assert_eq!(parse_proto("garbage"), None);
    }
}
