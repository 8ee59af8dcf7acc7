macro_rules! cfg_signal {
	($($item:item)*) => {
		$(
			#[cfg(feature = "signal")]
			$item
		)*
	};
}

pub(crate) use cfg_signal;
